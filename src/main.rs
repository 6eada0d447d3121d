use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use xsec_convert::config::ConversionConfig;
use xsec_convert::data::container::{read_container, ObjectKind, StoredObject};
use xsec_convert::pipeline::{self, RunSummary};

#[derive(Parser, Debug)]
#[command(name = "xsec-convert", version, about = "Cross-section table to container converter")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert every dataset in a manifest and write the container.
    Convert {
        /// JSON manifest describing the datasets.
        manifest: PathBuf,
        /// Container to write (.parquet or .json); overrides the manifest's `output`.
        output: Option<PathBuf>,
    },
    /// Parse, assemble and run the consistency check without writing anything.
    Check {
        /// JSON manifest describing the datasets.
        manifest: PathBuf,
    },
    /// List the objects stored in a container.
    Inspect {
        /// Container file (.parquet or .json).
        container: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Convert { manifest, output } => {
            let config = ConversionConfig::load(&manifest)?;
            let summary = pipeline::run(&config, output.as_deref())?;
            report(&summary);
        }
        Command::Check { manifest } => {
            let config = ConversionConfig::load(&manifest)?;
            let summary = pipeline::check_only(&config)?;
            report(&summary);
            if summary.mismatches() > 0 {
                error!("{} consistency problem(s) found", summary.mismatches());
                bail!("consistency check failed");
            }
        }
        Command::Inspect { container } => inspect(&container)?,
    }
    Ok(())
}

fn report(summary: &RunSummary) {
    for dataset in &summary.datasets {
        let status = match &dataset.report {
            Some(r) if r.is_consistent() => "consistent".to_string(),
            Some(r) => format!("{} mismatch(es)", r.mismatches.len()),
            None => "not checked".to_string(),
        };
        println!(
            "{:<40} {:>4} bins  {:>2} matrices  {status}",
            dataset.id, dataset.bins, dataset.contributions
        );
    }
    if let Some(path) = &summary.output {
        info!("{} objects written", summary.objects);
        println!("Wrote {} objects to {}", summary.objects, path.display());
    }
}

fn shape(object: &StoredObject) -> String {
    let bins = |edges: &[f64]| edges.len().saturating_sub(1);
    match object.kind {
        ObjectKind::Hist1d => format!("{}", bins(&object.x_edges)),
        ObjectKind::Hist2d => format!("{}x{}", bins(&object.x_edges), bins(&object.y_edges)),
        ObjectKind::Matrix => {
            let n = bins(&object.x_edges);
            format!("{n}x{n}")
        }
    }
}

fn inspect(path: &Path) -> Result<()> {
    let container = read_container(path)?;
    println!("{} ({} objects)", path.display(), container.len());
    for object in container.iter() {
        println!(
            "  {:<40} {:<7} {:>9}  {}",
            object.name,
            object.kind.as_str(),
            shape(object),
            object.title
        );
    }
    Ok(())
}
