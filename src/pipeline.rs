use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::config::{ConversionConfig, DatasetSpec};
use crate::data::assemble::{combine, load_matrix, MatrixKind};
use crate::data::check::{ConsistencyChecker, ConsistencyReport, MismatchPolicy};
use crate::data::container::{write_container, Container};
use crate::data::flatten::{build_grid, flatten};
use crate::data::linalg;
use crate::data::loader::{load_table, open_rows};
use crate::data::model::{Matrix, Table};

// ---------------------------------------------------------------------------
// Per-dataset state
// ---------------------------------------------------------------------------

/// A parsed and assembled dataset, before anything is written.
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    /// Measurement in the bin order the matrices use.
    pub table: Table,
    /// `(label, covariance)` per contribution, correlations already converted.
    pub contributions: Vec<(String, Matrix)>,
    /// Normalization contribution, when configured.
    pub normalization: Option<Matrix>,
    /// Sum of all contributions.
    pub total: Matrix,
    /// `None` when no check was possible (no published uncertainties).
    pub report: Option<ConsistencyReport>,
    /// Objects that only exist for two-dimensional inputs (`data2d`, `map`).
    container: Container,
}

/// What happened to one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSummary {
    pub id: String,
    pub bins: usize,
    pub contributions: usize,
    pub report: Option<ConsistencyReport>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSummary {
    pub output: Option<PathBuf>,
    pub datasets: Vec<DatasetSummary>,
    pub objects: usize,
}

impl RunSummary {
    pub fn mismatches(&self) -> usize {
        self.datasets
            .iter()
            .filter_map(|d| d.report.as_ref())
            .map(|r| r.mismatches.len() + usize::from(r.size_mismatch.is_some()))
            .sum()
    }
}

impl PreparedDataset {
    fn summary(&self, spec: &DatasetSpec) -> DatasetSummary {
        DatasetSummary {
            id: spec.id.clone(),
            bins: self.table.len(),
            contributions: self.contributions.len(),
            report: self.report.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Read the measurement: a table as-is, or a grid flattened through its bin map.
fn read_measurement(spec: &DatasetSpec, extra: &mut Container) -> Result<Table> {
    if let Some(source) = &spec.table {
        return load_table(&source.path, &source.spec);
    }
    let Some(source) = &spec.grid else {
        bail!("dataset '{}' has no measurement", spec.display_name());
    };
    let rows = open_rows(&source.path, &source.spec.row_format())?;
    let mut grid = build_grid(rows, &source.spec)
        .with_context(|| format!("reading grid {}", source.path.display()))?;
    grid.hist.name = spec.key("data2d");
    grid.hist.title = spec.title.clone();
    let flat = flatten(&grid.hist, &grid.map, &spec.key("data"));
    debug!(
        "flattened {}x{} grid to {} bins",
        grid.hist.x_axis.n_bins(),
        grid.hist.y_axis.n_bins(),
        flat.contents.len()
    );
    extra.add_histogram2d(&grid.hist);
    extra.add_histogram2d(&grid.map.to_histogram(
        &spec.key("map"),
        grid.hist.x_axis.clone(),
        grid.hist.y_axis.clone(),
    ));
    Ok(Table::new(flat.axis, flat.contents, flat.errors)?)
}

/// Parse, assemble and check one dataset.
pub fn prepare_dataset(spec: &DatasetSpec, config: &ConversionConfig) -> Result<PreparedDataset> {
    let name = spec.display_name();
    let mut container = Container::new();
    let mut table = read_measurement(spec, &mut container)
        .with_context(|| format!("dataset '{name}'"))?;
    info!("dataset '{name}': {} bins", table.len());

    let uncertainties = table.uncertainties();
    let mut contributions = Vec::with_capacity(spec.matrices.len());
    for source in &spec.matrices {
        let matrix = load_matrix(&source.path, &source.spec)
            .with_context(|| format!("dataset '{name}', matrix '{}'", source.label))?;
        let covariance = match source.spec.kind {
            MatrixKind::Covariance => matrix,
            MatrixKind::Correlation => linalg::correlation_to_covariance(&matrix, &uncertainties)
                .with_context(|| {
                    format!("dataset '{name}': correlation '{}' vs table", source.label)
                })?,
        };
        let dim = covariance.dim();
        debug!("dataset '{name}': '{}' is {dim}x{dim}", source.label);
        contributions.push((source.label.clone(), covariance));
    }

    let normalization = match spec.derived.normalization {
        Some(norm) => {
            let values = table.values();
            Some(linalg::with_normalization(&Matrix::zeros(values.len()), &values, norm)?)
        }
        None => None,
    };

    let mut parts: Vec<&Matrix> = contributions.iter().map(|(_, m)| m).collect();
    parts.extend(normalization.as_ref());
    let total = if parts.is_empty() {
        info!("dataset '{name}': no matrices given, using uncorrelated uncertainties");
        linalg::diagonal_covariance(&uncertainties)
    } else {
        combine(&parts).with_context(|| format!("dataset '{name}': combining contributions"))?
    };

    let report = if !contributions.is_empty() && uncertainties.iter().all(|&u| u == 0.0) {
        // Nothing to compare against: take the uncertainties from the matrix.
        info!("dataset '{name}': table has no uncertainties, using sqrt(diag(totcov))");
        let errors = total.diagonal().iter().map(|v| v.max(0.0).sqrt()).collect();
        table = Table::new(table.axis().clone(), table.values(), errors)?;
        None
    } else {
        let checker =
            ConsistencyChecker::new(config.tolerance_for(spec)).with_scale(spec.check_scale);
        let report = checker.check(&table, &total);
        if report.is_consistent() {
            info!("dataset '{name}': {} diagonal elements consistent", report.checked);
        } else {
            warn!(
                "dataset '{name}': {} of {} diagonal elements outside tolerance {}",
                report.mismatches.len(),
                report.checked,
                report.tolerance
            );
            if config.on_mismatch == MismatchPolicy::Fail {
                match report.size_mismatch {
                    Some(size) => bail!("dataset '{name}': table and covariance disagree, {size}"),
                    None => bail!(
                        "dataset '{name}': {} covariance diagonal element(s) disagree with the table",
                        report.mismatches.len()
                    ),
                }
            }
        }
        Some(report)
    };

    Ok(PreparedDataset {
        table,
        contributions,
        normalization,
        total,
        report,
        container,
    })
}

/// Add a prepared dataset's histogram and matrices to `out`.
pub fn emit_dataset(spec: &DatasetSpec, prepared: &PreparedDataset, out: &mut Container) -> Result<()> {
    let name = spec.display_name();
    let axis = Some(prepared.table.axis());
    let title = spec.title.as_str();

    for object in prepared.container.iter() {
        out.insert(object.clone());
    }
    out.add_histogram(&prepared.table.to_histogram(&spec.key("data"), title));

    for (label, matrix) in &prepared.contributions {
        out.add_matrix(&spec.key(&format!("{label}cov")), title, matrix, axis);
    }
    if let Some(norm) = &prepared.normalization {
        out.add_matrix(&spec.key("normcov"), title, norm, axis);
    }
    let total = &prepared.total;
    out.add_matrix(&spec.key("totcov"), title, total, axis);

    let derived = &spec.derived;
    if derived.correlation {
        out.add_matrix(
            &spec.key("totcrl"),
            title,
            &linalg::covariance_to_correlation(total),
            axis,
        );
    }
    if derived.diagonal {
        out.add_matrix(&spec.key("diagcov"), title, &linalg::diagonal_only(total), axis);
    }
    if derived.inverse {
        let inverse = linalg::invert(total)
            .with_context(|| format!("dataset '{name}': inverting totcov"))?;
        let identity = linalg::identity_check(&inverse, total)?;
        out.add_matrix(&spec.key("totcovinv"), title, &inverse, axis);
        out.add_matrix(&spec.key("totcovidt"), title, &identity, axis);
    }
    if derived.decomposition {
        let root = linalg::decompose(total)
            .with_context(|| format!("dataset '{name}': decomposing totcov"))?;
        out.add_matrix(&spec.key("totcovdec"), title, &root, axis);
    }
    if derived.shape_only {
        let shape = linalg::shape_only(total, &prepared.table.values())
            .with_context(|| format!("dataset '{name}': shape-only covariance"))?;
        out.add_matrix(&spec.key("shpcov"), title, &shape, axis);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Whole-manifest entry points
// ---------------------------------------------------------------------------

/// Convert every dataset into one in-memory container.
pub fn convert(config: &ConversionConfig) -> Result<(Container, RunSummary)> {
    let mut container = Container::new();
    let mut summary = RunSummary::default();
    for spec in &config.datasets {
        let prepared = prepare_dataset(spec, config)?;
        emit_dataset(spec, &prepared, &mut container)?;
        summary.datasets.push(prepared.summary(spec));
    }
    summary.objects = container.len();
    Ok((container, summary))
}

/// Convert and write the container to `output` (or the manifest's `output`).
pub fn run(config: &ConversionConfig, output: Option<&Path>) -> Result<RunSummary> {
    let Some(path) = output.map(Path::to_path_buf).or_else(|| config.output.clone()) else {
        bail!("no output path: give one on the command line or set \"output\" in the manifest");
    };
    let (container, mut summary) = convert(config)?;
    write_container(&path, &container)
        .with_context(|| format!("writing container {}", path.display()))?;
    summary.output = Some(path);
    Ok(summary)
}

/// Parse, assemble and check without producing any output.
pub fn check_only(config: &ConversionConfig) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    for spec in &config.datasets {
        let prepared = prepare_dataset(spec, config)?;
        summary.datasets.push(prepared.summary(spec));
    }
    Ok(summary)
}
