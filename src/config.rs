use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::data::assemble::MatrixSpec;
use crate::data::check::{ConsistencyChecker, MismatchPolicy};
use crate::data::flatten::GridSpec;
use crate::data::loader::{TableFormat, TableSpec};

// ---------------------------------------------------------------------------
// Manifest types
// ---------------------------------------------------------------------------

/// One-dimensional measurement table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSource {
    pub path: PathBuf,
    #[serde(flatten)]
    pub spec: TableSpec,
}

/// Two-dimensional measurement, flattened before matrices are attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSource {
    pub path: PathBuf,
    #[serde(flatten)]
    pub spec: GridSpec,
}

/// One covariance (or correlation) contribution, e.g. `stat` or `syst`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixSource {
    pub label: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub spec: MatrixSpec,
}

/// Optional matrices derived from the total covariance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivedOutputs {
    pub correlation: bool,
    pub inverse: bool,
    pub decomposition: bool,
    pub diagonal: bool,
    pub shape_only: bool,
    /// Fractional normalization uncertainty added to the total as `normcov`.
    pub normalization: Option<f64>,
}

impl Default for DerivedOutputs {
    fn default() -> Self {
        Self {
            correlation: true,
            inverse: false,
            decomposition: false,
            diagonal: false,
            shape_only: false,
            normalization: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// Prefix of every object key written for this dataset.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub table: Option<TableSource>,
    #[serde(default)]
    pub grid: Option<GridSource>,
    #[serde(default)]
    pub matrices: Vec<MatrixSource>,
    /// Overrides the manifest-wide tolerance.
    #[serde(default)]
    pub tolerance: Option<f64>,
    /// Factor applied to table uncertainties before the diagonal check.
    #[serde(default = "unit_scale")]
    pub check_scale: f64,
    #[serde(default)]
    pub derived: DerivedOutputs,
}

/// Labels whose `<label>cov` key is written by the pipeline itself.
const RESERVED_LABELS: [&str; 4] = ["tot", "norm", "diag", "shp"];

fn unit_scale() -> f64 {
    1.0
}

fn default_tolerance() -> f64 {
    ConsistencyChecker::DEFAULT_TOLERANCE
}

impl DatasetSpec {
    /// Object key `<id>_<name>`, or just `name` when the id is empty.
    pub fn key(&self, name: &str) -> String {
        if self.id.is_empty() {
            name.to_string()
        } else {
            format!("{}_{name}", self.id)
        }
    }

    /// A readable name for log messages.
    pub fn display_name(&self) -> &str {
        if self.id.is_empty() {
            "<unnamed>"
        } else {
            &self.id
        }
    }
}

/// Everything one conversion run needs; passed explicitly to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default)]
    pub on_mismatch: MismatchPolicy,
    pub datasets: Vec<DatasetSpec>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl ConversionConfig {
    /// Read a JSON manifest. Relative paths inside it are taken relative to
    /// the manifest's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Self::from_json(&text, base).with_context(|| format!("in manifest {}", path.display()))
    }

    pub fn from_json(text: &str, base: &Path) -> Result<Self> {
        let mut config: ConversionConfig =
            serde_json::from_str(text).context("parsing manifest JSON")?;
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(output) = self.output.as_mut() {
            resolve(output);
        }
        for dataset in &mut self.datasets {
            if let Some(table) = dataset.table.as_mut() {
                resolve(&mut table.path);
            }
            if let Some(grid) = dataset.grid.as_mut() {
                resolve(&mut grid.path);
            }
            for matrix in &mut dataset.matrices {
                resolve(&mut matrix.path);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance > 0.0) {
            bail!("tolerance must be positive, got {}", self.tolerance);
        }
        let mut ids = HashSet::new();
        for dataset in &self.datasets {
            let name = dataset.display_name();
            if !ids.insert(dataset.id.as_str()) {
                bail!("dataset id '{name}' appears more than once");
            }
            match (&dataset.table, &dataset.grid) {
                (Some(_), None) | (None, Some(_)) => {}
                (None, None) => bail!("dataset '{name}' has neither a table nor a grid"),
                (Some(_), Some(_)) => bail!("dataset '{name}' has both a table and a grid"),
            }
            if let Some(grid) = &dataset.grid {
                let g = &grid.spec;
                for (axis, range, low, high) in [
                    ("x", g.x_range, g.x_low, g.x_high),
                    ("y", g.y_range, g.y_low, g.y_high),
                ] {
                    if range.is_none() && (low.is_none() || high.is_none()) {
                        bail!("dataset '{name}': grid {axis} axis needs a range column or both edge columns");
                    }
                }
            }
            let formats = dataset
                .table
                .iter()
                .map(|t| &t.spec.format)
                .chain(dataset.grid.iter().map(|g| &g.spec.format))
                .chain(dataset.matrices.iter().map(|m| &m.spec.format));
            for format in formats {
                check_section(format).with_context(|| format!("dataset '{name}'"))?;
            }
            if let Some(t) = dataset.tolerance {
                if !(t > 0.0) {
                    bail!("dataset '{name}': tolerance must be positive, got {t}");
                }
            }
            let mut labels = HashSet::new();
            for matrix in &dataset.matrices {
                if RESERVED_LABELS.contains(&matrix.label.as_str()) {
                    bail!(
                        "dataset '{name}': matrix label '{}' collides with a derived matrix",
                        matrix.label
                    );
                }
                if !labels.insert(matrix.label.as_str()) {
                    bail!("dataset '{name}': matrix label '{}' is used twice", matrix.label);
                }
            }
        }
        Ok(())
    }

    pub fn tolerance_for(&self, dataset: &DatasetSpec) -> f64 {
        dataset.tolerance.unwrap_or(self.tolerance)
    }
}

fn check_section(format: &TableFormat) -> Result<()> {
    if let Some(section) = &format.section {
        if section.title.iter().all(|t| t.trim().is_empty()) {
            bail!("section title is empty");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::assemble::{MatrixKind, MatrixLayout};
    use crate::data::loader::{Delimiter, TableLayout};

    const MANIFEST: &str = r#"{
        "output": "out.parquet",
        "on_mismatch": "fail",
        "datasets": [{
            "id": "CC1pip_Tpi",
            "table": {
                "path": "tables/tpi.csv",
                "format": { "fields": 2 },
                "layout": { "kind": "range_label", "value": 0, "uncertainty": 1 },
                "scale": 1e-38
            },
            "matrices": [
                { "label": "stat", "path": "/abs/stat.txt",
                  "format": { "delimiter": "whitespace", "label": false },
                  "layout": { "kind": "dense" } },
                { "label": "syst", "path": "syst.csv",
                  "layout": { "kind": "triples", "index_base": 1 },
                  "kind": "correlation" }
            ],
            "tolerance": 0.1,
            "derived": { "inverse": true }
        }]
    }"#;

    #[test]
    fn manifest_parses_with_defaults() {
        let config = ConversionConfig::from_json(MANIFEST, Path::new("/data")).unwrap();
        assert_eq!(config.output, Some(PathBuf::from("/data/out.parquet")));
        assert_eq!(config.tolerance, ConsistencyChecker::DEFAULT_TOLERANCE);
        assert_eq!(config.on_mismatch, MismatchPolicy::Fail);

        let ds = &config.datasets[0];
        assert_eq!(config.tolerance_for(ds), 0.1);
        assert_eq!(ds.key("totcov"), "CC1pip_Tpi_totcov");
        assert!(ds.derived.inverse && ds.derived.correlation);
        assert!(!ds.derived.decomposition);

        let table = ds.table.as_ref().unwrap();
        assert_eq!(table.path, PathBuf::from("/data/tables/tpi.csv"));
        assert_eq!(table.spec.format.delimiter, Delimiter::Semicolon);
        assert_eq!(table.spec.scale, 1e-38);
        assert!(matches!(table.spec.layout, TableLayout::RangeLabel { value: 0, uncertainty: 1 }));

        let stat = &ds.matrices[0];
        assert_eq!(stat.path, PathBuf::from("/abs/stat.txt"));
        assert_eq!(stat.spec.layout, MatrixLayout::Dense);
        assert_eq!(stat.spec.kind, MatrixKind::Covariance);
        let syst = &ds.matrices[1];
        assert_eq!(syst.spec.kind, MatrixKind::Correlation);
        assert_eq!(
            syst.spec.layout,
            MatrixLayout::Triples { index_base: 1, symmetric: false }
        );
    }

    #[test]
    fn empty_id_gives_bare_keys() {
        let ds = DatasetSpec {
            id: String::new(),
            title: String::new(),
            table: None,
            grid: None,
            matrices: Vec::new(),
            tolerance: None,
            check_scale: 1.0,
            derived: DerivedOutputs::default(),
        };
        assert_eq!(ds.key("data"), "data");
    }

    #[test]
    fn dataset_without_measurement_is_rejected() {
        let text = r#"{ "datasets": [{ "id": "a" }] }"#;
        let err = ConversionConfig::from_json(text, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("neither"));
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let text = r#"{ "datasets": [{
            "id": "a",
            "table": { "path": "t.csv", "layout": { "kind": "range_label", "value": 0, "uncertainty": 1 } },
            "matrices": [
                { "label": "stat", "path": "s.csv", "layout": { "kind": "dense" } },
                { "label": "stat", "path": "s2.csv", "layout": { "kind": "dense" } }
            ]
        }] }"#;
        assert!(ConversionConfig::from_json(text, Path::new(".")).is_err());
    }

    #[test]
    fn grid_axes_and_sections_are_validated() {
        let grid = r#"{ "datasets": [{
            "grid": {
                "path": "g.txt",
                "x_edges": [0, 1], "y_edges": [0, 1],
                "x_range": 0, "y_low": 1,
                "value": 3
            }
        }] }"#;
        let err = ConversionConfig::from_json(grid, Path::new(".")).unwrap_err();
        assert!(format!("{err:#}").contains("grid y axis"), "{err:#}");

        let complete = grid.replace(r#""y_low": 1"#, r#""y_range": 1"#);
        let config = ConversionConfig::from_json(&complete, Path::new(".")).unwrap();
        let spec = &config.datasets[0].grid.as_ref().unwrap().spec;
        assert_eq!(spec.x_range, Some(0));
        assert!(spec.row_format().range_cells);

        let section = r#"{ "datasets": [{
            "table": {
                "path": "t.csv",
                "format": { "section": { "title": [""] } },
                "layout": { "kind": "range_label", "value": 0, "uncertainty": 1 }
            }
        }] }"#;
        let err = ConversionConfig::from_json(section, Path::new(".")).unwrap_err();
        assert!(format!("{err:#}").contains("section title is empty"), "{err:#}");
    }
}
