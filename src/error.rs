use thiserror::Error;

/// Malformed or inconsistent input table content.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormatError {
    #[error("line {line}: field {field} ('{token}') is not a number")]
    InvalidNumber {
        line: usize,
        field: usize,
        token: String,
    },

    #[error("line {line}: expected {expected} numeric fields, found {found}")]
    FieldCount {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: cannot read label '{label}' as {expected}")]
    BadLabel {
        line: usize,
        label: String,
        expected: &'static str,
    },

    #[error("line {line}: row has no label column")]
    MissingLabel { line: usize },

    #[error("matrix is not square: {rows} rows but row {row} has {columns} columns")]
    NotSquare {
        rows: usize,
        row: usize,
        columns: usize,
    },

    #[error("line {line}: index {index} is below the index base {base}")]
    IndexBase { line: usize, index: usize, base: usize },

    #[error("bin edges must be strictly increasing (edge {index}: {prev} then {next})")]
    NonIncreasingEdges { index: usize, prev: f64, next: f64 },

    #[error("an axis needs at least two edges, got {edges}")]
    EmptyAxis { edges: usize },

    #[error("axis has {expected} bins but {found} values were supplied")]
    BinCount { expected: usize, found: usize },

    #[error("line {line}: point ({x}, {y}) lies outside the grid")]
    OutsideGrid { line: usize, x: f64, y: f64 },

    #[error("line {line}: index {index} exceeds the limit of {limit}")]
    IndexTooLarge {
        line: usize,
        index: String,
        limit: usize,
    },

    #[error("line {line}: cell ({ix}, {iy}) is filled twice")]
    DuplicateCell { line: usize, ix: usize, iy: usize },

    #[error("line {line}: flat bin {bin} is assigned to two cells")]
    DuplicateBin { line: usize, bin: usize },

    #[error("grid has no {axis} columns (set a range column or both edge columns)")]
    MissingColumns { axis: &'static str },

    #[error("no line matches the section title {title:?}")]
    SectionNotFound { title: Vec<String> },

    #[error("no data rows found")]
    NoRows,

    #[error("line {line}: {message}")]
    Read { line: usize, message: String },
}

/// Two matrices (or a matrix and a table) that must share a dimension don't.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dimension mismatch: {left} vs {right}")]
pub struct DimensionMismatch {
    pub left: usize,
    pub right: usize,
}

/// A matrix index at or beyond [`crate::data::assemble::MAX_DIM`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("matrix index {index} exceeds the limit of {limit}")]
pub struct IndexLimit {
    pub index: usize,
    pub limit: usize,
}

/// Failures of the matrix transforms in [`crate::data::linalg`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinalgError {
    #[error("singular value decomposition failed: {0}")]
    Decomposition(&'static str),

    #[error(transparent)]
    Dimension(#[from] DimensionMismatch),

    #[error("shape-only extraction needs non-zero data and covariance totals")]
    Degenerate,
}
