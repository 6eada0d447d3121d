use std::fmt;

use log::warn;
use nalgebra::DMatrix;

use crate::error::FormatError;

// ---------------------------------------------------------------------------
// RowLabel – the leading cell of a table row
// ---------------------------------------------------------------------------

/// A dynamically-typed row label as found in published tables.
///
/// Labels are guessed from the token: `"7"` is an index, `"3-5"` an index
/// pair (matrix element), `"0.2 - 0.35"` a bin range, anything else text.
#[derive(Debug, Clone, PartialEq)]
pub enum RowLabel {
    Index(i64),
    IndexPair(usize, usize),
    Range(f64, f64),
    Text(String),
}

impl RowLabel {
    pub fn guess(token: &str) -> Self {
        let s = token.trim();
        if let Ok(i) = s.parse::<i64>() {
            return RowLabel::Index(i);
        }
        if let Some((a, b)) = parse_index_pair(s) {
            return RowLabel::IndexPair(a, b);
        }
        if let Some((lo, hi)) = parse_range(s) {
            return RowLabel::Range(lo, hi);
        }
        RowLabel::Text(s.to_string())
    }

    /// Interpret the label as a `(low, high)` bin range.
    pub fn as_range(&self) -> Option<(f64, f64)> {
        match self {
            RowLabel::Range(lo, hi) => Some((*lo, *hi)),
            RowLabel::IndexPair(a, b) => Some((*a as f64, *b as f64)),
            _ => None,
        }
    }

    /// Interpret the label as a `(row, column)` matrix element.
    pub fn as_index_pair(&self) -> Option<(usize, usize)> {
        match self {
            RowLabel::IndexPair(a, b) => Some((*a, *b)),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<i64> {
        match self {
            RowLabel::Index(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for RowLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowLabel::Index(i) => write!(f, "{i}"),
            RowLabel::IndexPair(a, b) => write!(f, "{a}-{b}"),
            RowLabel::Range(lo, hi) => write!(f, "{lo} - {hi}"),
            RowLabel::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Split `"lo-hi"` / `"lo - hi"` at the separating dash.
///
/// A leading minus sign and the sign of an exponent (`1e-3`) are not
/// separators.
fn split_dash(s: &str) -> Option<(&str, &str)> {
    if let Some((l, r)) = s.split_once(" - ") {
        return Some((l.trim(), r.trim()));
    }
    let bytes = s.as_bytes();
    for (i, &c) in bytes.iter().enumerate().skip(1) {
        if c != b'-' {
            continue;
        }
        let prev = bytes[i - 1];
        if matches!(prev, b'e' | b'E' | b'-' | b' ') {
            continue;
        }
        return Some((s[..i].trim(), s[i + 1..].trim()));
    }
    None
}

/// Parse a bin range label such as `"0.2 - 0.35"` or `"-1.0--0.5"`.
pub fn parse_range(s: &str) -> Option<(f64, f64)> {
    let (l, r) = split_dash(s.trim())?;
    Some((l.parse().ok()?, r.parse().ok()?))
}

/// Parse a matrix element label such as `"3-5"`.
pub fn parse_index_pair(s: &str) -> Option<(usize, usize)> {
    let (l, r) = split_dash(s.trim())?;
    Some((l.parse().ok()?, r.parse().ok()?))
}

// ---------------------------------------------------------------------------
// BinAxis
// ---------------------------------------------------------------------------

/// Ordered bin edges: `n + 1` strictly increasing edges for `n` bins.
#[derive(Debug, Clone, PartialEq)]
pub struct BinAxis {
    edges: Vec<f64>,
}

impl BinAxis {
    pub fn new(edges: Vec<f64>) -> Result<Self, FormatError> {
        if edges.len() < 2 {
            return Err(FormatError::EmptyAxis { edges: edges.len() });
        }
        for (i, w) in edges.windows(2).enumerate() {
            if !(w[1] > w[0]) {
                return Err(FormatError::NonIncreasingEdges {
                    index: i + 1,
                    prev: w[0],
                    next: w[1],
                });
            }
        }
        Ok(BinAxis { edges })
    }

    /// `n` unit-width bins starting at zero, used for index-only matrix axes.
    pub fn indices(n: usize) -> Self {
        BinAxis {
            edges: (0..=n.max(1)).map(|i| i as f64).collect(),
        }
    }

    /// Build an axis from per-bin `(low, high)` ranges.
    ///
    /// Consecutive ranges are expected to touch. A gap or overlap is logged
    /// and the next bin's low edge wins.
    pub fn from_ranges(ranges: &[(f64, f64)]) -> Result<Self, FormatError> {
        let Some(&(first_lo, _)) = ranges.first() else {
            return Err(FormatError::EmptyAxis { edges: 0 });
        };
        let mut edges = Vec::with_capacity(ranges.len() + 1);
        edges.push(first_lo);
        for (i, pair) in ranges.windows(2).enumerate() {
            let (_, hi) = pair[0];
            let (next_lo, _) = pair[1];
            let tol = 1e-9 * hi.abs().max(next_lo.abs()).max(1.0);
            if (hi - next_lo).abs() > tol {
                warn!("bin mismatch: bin {i} ends at {hi} but bin {} starts at {next_lo}", i + 1);
            }
            edges.push(next_lo);
        }
        edges.push(ranges[ranges.len() - 1].1);
        BinAxis::new(edges)
    }

    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn low(&self, bin: usize) -> f64 {
        self.edges[bin]
    }

    pub fn high(&self, bin: usize) -> f64 {
        self.edges[bin + 1]
    }

    pub fn center(&self, bin: usize) -> f64 {
        0.5 * (self.edges[bin] + self.edges[bin + 1])
    }

    pub fn width(&self, bin: usize) -> f64 {
        self.edges[bin + 1] - self.edges[bin]
    }

    /// Bin containing `x` (low edge inclusive), if inside the axis.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        let last = *self.edges.last()?;
        if x < self.edges[0] || x >= last {
            return None;
        }
        Some(self.edges.partition_point(|&e| e <= x) - 1)
    }
}

// ---------------------------------------------------------------------------
// Table – one measured distribution
// ---------------------------------------------------------------------------

/// One bin of a measurement table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableBin {
    pub center: f64,
    pub value: f64,
    pub uncertainty: f64,
}

/// Bin index → (center, value, uncertainty). Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    axis: BinAxis,
    bins: Vec<TableBin>,
}

impl Table {
    pub fn new(
        axis: BinAxis,
        values: Vec<f64>,
        uncertainties: Vec<f64>,
    ) -> Result<Self, FormatError> {
        let n = axis.n_bins();
        for found in [values.len(), uncertainties.len()] {
            if found != n {
                return Err(FormatError::BinCount { expected: n, found });
            }
        }
        let bins = values
            .into_iter()
            .zip(uncertainties)
            .enumerate()
            .map(|(i, (value, uncertainty))| TableBin {
                center: axis.center(i),
                value,
                uncertainty,
            })
            .collect();
        Ok(Table { axis, bins })
    }

    pub fn axis(&self) -> &BinAxis {
        &self.axis
    }

    pub fn bins(&self) -> &[TableBin] {
        &self.bins
    }

    pub fn get(&self, bin: usize) -> Option<&TableBin> {
        self.bins.get(bin)
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.value).collect()
    }

    pub fn uncertainties(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.uncertainty).collect()
    }

    pub fn to_histogram(&self, name: &str, title: &str) -> Histogram1D {
        Histogram1D {
            name: name.to_string(),
            title: title.to_string(),
            axis: self.axis.clone(),
            contents: self.values(),
            errors: self.uncertainties(),
        }
    }
}

// ---------------------------------------------------------------------------
// Histograms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram1D {
    pub name: String,
    pub title: String,
    pub axis: BinAxis,
    /// Bin contents, one per bin.
    pub contents: Vec<f64>,
    /// Bin errors, one per bin.
    pub errors: Vec<f64>,
}

impl Histogram1D {
    pub fn zeros(name: &str, title: &str, axis: BinAxis) -> Self {
        let n = axis.n_bins();
        Histogram1D {
            name: name.to_string(),
            title: title.to_string(),
            axis,
            contents: vec![0.0; n],
            errors: vec![0.0; n],
        }
    }
}

/// 2D histogram with contents stored x-major: `index = ix * ny + iy`.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram2D {
    pub name: String,
    pub title: String,
    pub x_axis: BinAxis,
    pub y_axis: BinAxis,
    pub contents: Vec<f64>,
    pub errors: Vec<f64>,
}

impl Histogram2D {
    pub fn zeros(name: &str, title: &str, x_axis: BinAxis, y_axis: BinAxis) -> Self {
        let n = x_axis.n_bins() * y_axis.n_bins();
        Histogram2D {
            name: name.to_string(),
            title: title.to_string(),
            x_axis,
            y_axis,
            contents: vec![0.0; n],
            errors: vec![0.0; n],
        }
    }

    fn index(&self, ix: usize, iy: usize) -> usize {
        ix * self.y_axis.n_bins() + iy
    }

    pub fn get(&self, ix: usize, iy: usize) -> f64 {
        self.contents[self.index(ix, iy)]
    }

    pub fn error(&self, ix: usize, iy: usize) -> f64 {
        self.errors[self.index(ix, iy)]
    }

    pub fn set(&mut self, ix: usize, iy: usize, value: f64, error: f64) {
        let i = self.index(ix, iy);
        self.contents[i] = value;
        self.errors[i] = error;
    }
}

// ---------------------------------------------------------------------------
// Matrix – square covariance / correlation container
// ---------------------------------------------------------------------------

/// Square `(row, column) → f64` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    values: DMatrix<f64>,
}

impl Matrix {
    pub fn zeros(dim: usize) -> Self {
        Matrix {
            values: DMatrix::zeros(dim, dim),
        }
    }

    /// Wrap an already-square nalgebra matrix.
    pub(crate) fn from_dmatrix(values: DMatrix<f64>) -> Self {
        debug_assert_eq!(values.nrows(), values.ncols());
        Matrix { values }
    }

    pub fn from_diagonal(diag: &[f64]) -> Self {
        let mut m = Matrix::zeros(diag.len());
        for (i, &v) in diag.iter().enumerate() {
            m.set(i, i, v);
        }
        m
    }

    /// Build from dense rows; every row must have as many columns as there are rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, FormatError> {
        let n = rows.len();
        let mut values = DMatrix::zeros(n, n);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n {
                return Err(FormatError::NotSquare {
                    rows: n,
                    row: i,
                    columns: row.len(),
                });
            }
            for (j, &v) in row.iter().enumerate() {
                values[(i, j)] = v;
            }
        }
        Ok(Matrix { values })
    }

    pub fn from_row_major(dim: usize, data: &[f64]) -> Result<Self, FormatError> {
        if data.len() != dim * dim {
            return Err(FormatError::NotSquare {
                rows: dim,
                row: 0,
                columns: data.len() / dim.max(1),
            });
        }
        Ok(Matrix {
            values: DMatrix::from_row_slice(dim, dim, data),
        })
    }

    pub fn dim(&self) -> usize {
        self.values.nrows()
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[(row, col)]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.values[(row, col)] = value;
    }

    pub fn diagonal(&self) -> Vec<f64> {
        self.values.diagonal().iter().copied().collect()
    }

    /// True when every off-diagonal element is exactly zero.
    pub fn is_diagonal(&self) -> bool {
        let n = self.dim();
        (0..n).all(|i| (0..n).all(|j| i == j || self.values[(i, j)] == 0.0))
    }

    pub fn is_symmetric(&self, tolerance: f64) -> bool {
        let n = self.dim();
        (0..n).all(|i| {
            (0..i).all(|j| {
                let a = self.values[(i, j)];
                let b = self.values[(j, i)];
                (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(f64::MIN_POSITIVE)
            })
        })
    }

    pub fn as_dmatrix(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn scaled(&self, factor: f64) -> Matrix {
        Matrix {
            values: &self.values * factor,
        }
    }

    /// Row-major copy of the elements.
    pub fn to_row_major(&self) -> Vec<f64> {
        let n = self.dim();
        let mut out = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                out.push(self.values[(i, j)]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_guessed_by_shape() {
        assert_eq!(RowLabel::guess("7"), RowLabel::Index(7));
        assert_eq!(RowLabel::guess("3-5"), RowLabel::IndexPair(3, 5));
        assert_eq!(RowLabel::guess("0.2 - 0.35"), RowLabel::Range(0.2, 0.35));
        assert_eq!(RowLabel::guess("-1.0--0.5"), RowLabel::Range(-1.0, -0.5));
        assert_eq!(RowLabel::guess("1e-3-2e-3"), RowLabel::Range(1e-3, 2e-3));
        assert_eq!(RowLabel::guess("bin"), RowLabel::Text("bin".into()));
    }

    #[test]
    fn axis_rejects_unsorted_edges() {
        assert!(BinAxis::new(vec![0.0, 1.0, 1.0]).is_err());
        assert!(BinAxis::new(vec![0.0]).is_err());
        let axis = BinAxis::new(vec![0.0, 0.5, 2.0]).unwrap();
        assert_eq!(axis.n_bins(), 2);
        assert_eq!(axis.center(1), 1.25);
        assert_eq!(axis.find_bin(0.5), Some(1));
        assert_eq!(axis.find_bin(2.0), None);
    }

    #[test]
    fn ranges_with_a_gap_still_build_an_axis() {
        let axis = BinAxis::from_ranges(&[(0.0, 1.0), (1.2, 2.0)]).unwrap();
        assert_eq!(axis.edges(), &[0.0, 1.2, 2.0]);
    }

    #[test]
    fn table_requires_one_value_per_bin() {
        let axis = BinAxis::new(vec![0.0, 1.0, 2.0]).unwrap();
        let err = Table::new(axis, vec![1.0], vec![0.1]).unwrap_err();
        assert_eq!(err, FormatError::BinCount { expected: 2, found: 1 });
    }

    #[test]
    fn ragged_rows_are_not_square() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(matches!(
            Matrix::from_rows(&rows),
            Err(FormatError::NotSquare { row: 1, .. })
        ));
    }
}
