use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

const N_BINS: usize = 10;
const BIN_WIDTH: f64 = 0.2;

fn gaussian(x: f64, mu: f64, sigma: f64, amplitude: f64) -> f64 {
    amplitude * (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp()
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

/// Round-trip a number through the text precision used in the files.
fn written(v: f64) -> f64 {
    format!("{v:.6e}").parse().unwrap_or(v)
}

fn write_file(dir: &Path, name: &str, text: &str) -> Result<()> {
    let path = dir.join(name);
    fs::write(&path, text).with_context(|| format!("writing {}", path.display()))
}

/// Write a synthetic measurement and a conversion manifest for it.
#[derive(Parser, Debug)]
#[command(name = "generate_sample", version)]
struct Args {
    /// Output directory
    #[arg(default_value = ".")]
    dir: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();

    let Args { dir } = Args::parse();
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut rng = SimpleRng::new(42);

    // Cross-section in units of 1e-39 cm², smeared around a Gaussian peak.
    let values: Vec<f64> = (0..N_BINS)
        .map(|i| {
            let center = (i as f64 + 0.5) * BIN_WIDTH;
            let truth = gaussian(center, 0.8, 0.45, 5.0) + 0.2;
            written(truth * (1.0 + rng.gauss(0.0, 0.02)))
        })
        .collect();

    // Statistical: diagonal, ~5 %. Systematic: 8 % fully correlated over
    // neighbours with exponential fall-off.
    let stat: Vec<f64> = values.iter().map(|v| written((0.05 * v).powi(2))).collect();
    let syst_sigma: Vec<f64> = values.iter().map(|v| 0.08 * v).collect();
    let mut syst = vec![vec![0.0; N_BINS]; N_BINS];
    for i in 0..N_BINS {
        for j in 0..N_BINS {
            let rho = (-(i.abs_diff(j) as f64) / 2.0).exp();
            syst[i][j] = written(rho * syst_sigma[i] * syst_sigma[j]);
        }
    }
    let errors: Vec<f64> = (0..N_BINS).map(|i| (stat[i] + syst[i][i]).sqrt()).collect();

    // Table: `lo-hi;value;error`, HEPData style.
    let mut table = String::from("# synthetic d(sigma)/dT, 1e-39 cm^2/GeV\nT [GeV];xsec;error\n");
    for i in 0..N_BINS {
        let lo = i as f64 * BIN_WIDTH;
        writeln!(table, "{lo:.1}-{:.1};{:.6e};{:.6e}", lo + BIN_WIDTH, values[i], errors[i])?;
    }
    write_file(&dir, "xsec.csv", &table)?;

    // Statistical covariance: whitespace-separated dense rows.
    let mut stat_text = String::new();
    for i in 0..N_BINS {
        let row: Vec<String> = (0..N_BINS)
            .map(|j| if i == j { format!("{:.6e}", stat[i]) } else { "0".to_string() })
            .collect();
        writeln!(stat_text, "{}", row.join(" "))?;
    }
    write_file(&dir, "stat_cov.txt", &stat_text)?;

    // Systematic covariance: pipe table of upper-triangle `i-j` elements, 1-based.
    let mut syst_text = String::from("| element | cov |\n|---|---|\n");
    for i in 0..N_BINS {
        for j in i..N_BINS {
            writeln!(syst_text, "| {}-{} | {:.6e} |", i + 1, j + 1, syst[i][j])?;
        }
    }
    write_file(&dir, "syst_cov.txt", &syst_text)?;

    // Total correlation: comma-separated dense rows with a bin label.
    let mut corr_text = String::new();
    for i in 0..N_BINS {
        let row: Vec<String> = (0..N_BINS)
            .map(|j| {
                let cov = syst[i][j] + if i == j { stat[i] } else { 0.0 };
                format!("{:.8}", cov / (errors[i] * errors[j]))
            })
            .collect();
        writeln!(corr_text, "{},{}", i + 1, row.join(","))?;
    }
    write_file(&dir, "total_corr.csv", &corr_text)?;

    let table_source = json!({
        "path": "xsec.csv",
        "format": { "fields": 2 },
        "layout": { "kind": "range_label", "value": 0, "uncertainty": 1 },
        "scale": 1e-39
    });
    let manifest = json!({
        "output": "sample_xsec.parquet",
        "tolerance": 1e-3,
        "on_mismatch": "warn",
        "datasets": [
            {
                "id": "Sample_T",
                "title": "Synthetic dsigma/dT",
                "table": table_source.clone(),
                "matrices": [
                    {
                        "label": "stat",
                        "path": "stat_cov.txt",
                        "format": { "delimiter": "whitespace", "label": false },
                        "layout": { "kind": "dense" },
                        "scale": 1e-78
                    },
                    {
                        "label": "syst",
                        "path": "syst_cov.txt",
                        "format": { "delimiter": "pipe", "fields": 1 },
                        "layout": { "kind": "triples", "index_base": 1, "symmetric": true },
                        "scale": 1e-78
                    }
                ],
                "derived": { "inverse": true, "decomposition": true, "diagonal": true }
            },
            {
                "id": "Sample_T_corr",
                "title": "Synthetic dsigma/dT (total correlation)",
                "table": table_source,
                "matrices": [
                    {
                        "label": "full",
                        "path": "total_corr.csv",
                        "format": { "delimiter": "comma" },
                        "layout": { "kind": "dense" },
                        "kind": "correlation"
                    }
                ],
                "derived": { "shape_only": true }
            }
        ]
    });
    let text = serde_json::to_string_pretty(&manifest)?;
    write_file(&dir, "manifest.json", &text)?;

    println!(
        "Wrote a {N_BINS}-bin sample (table, stat/syst covariances, correlation, manifest) to {}",
        dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_directory_defaults_to_cwd() {
        let args = Args::try_parse_from(["generate_sample"]).unwrap();
        assert_eq!(args.dir, PathBuf::from("."));

        let args = Args::try_parse_from(["generate_sample", "out/sample"]).unwrap();
        assert_eq!(args.dir, PathBuf::from("out/sample"));

        assert!(Args::try_parse_from(["generate_sample", "a", "b"]).is_err());
    }
}
