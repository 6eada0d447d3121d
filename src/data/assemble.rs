use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::loader::{open_rows, Row, TableFormat};
use super::model::Matrix;
use crate::error::{DimensionMismatch, FormatError, IndexLimit};

// ---------------------------------------------------------------------------
// Matrix sources
// ---------------------------------------------------------------------------

/// What the numbers in a matrix file mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixKind {
    #[default]
    Covariance,
    /// Converted to covariance with the table uncertainties.
    Correlation,
}

/// How matrix elements are laid out in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatrixLayout {
    /// One matrix row per line (a label column, if any, is ignored).
    Dense,
    /// One element per line: an `i-j` label followed by the value, or
    /// three numeric fields `i j value`.
    Triples {
        #[serde(default)]
        index_base: usize,
        /// Mirror each element into the other triangle unless given explicitly.
        #[serde(default)]
        symmetric: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixSpec {
    #[serde(default)]
    pub format: TableFormat,
    pub layout: MatrixLayout,
    #[serde(default)]
    pub kind: MatrixKind,
    /// Multiplies every element after assembly.
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

fn unit_scale() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

/// Largest matrix dimension accepted from a file.
pub const MAX_DIM: usize = 1 << 13;

/// Collects `(row, column, value)` triples into a dense square matrix
/// sized to the largest index seen.
#[derive(Debug, Default)]
pub struct MatrixAssembler {
    entries: Vec<(usize, usize, f64)>,
    dim: usize,
    symmetric: bool,
}

impl MatrixAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symmetric(mut self, symmetric: bool) -> Self {
        self.symmetric = symmetric;
        self
    }

    /// Later insertions at the same position win.
    pub fn insert(&mut self, row: usize, col: usize, value: f64) -> Result<(), IndexLimit> {
        let index = row.max(col);
        if index >= MAX_DIM {
            return Err(IndexLimit {
                index,
                limit: MAX_DIM,
            });
        }
        self.dim = self.dim.max(index + 1);
        self.entries.push((row, col, value));
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn finish(self) -> Matrix {
        let mut m = Matrix::zeros(self.dim);
        let explicit: HashSet<(usize, usize)> =
            self.entries.iter().map(|&(i, j, _)| (i, j)).collect();
        for &(i, j, v) in &self.entries {
            m.set(i, j, v);
            if self.symmetric && !explicit.contains(&(j, i)) {
                m.set(j, i, v);
            }
        }
        m
    }
}

/// Element-wise sum of matrices sharing one dimension.
pub fn combine(parts: &[&Matrix]) -> Result<Matrix, DimensionMismatch> {
    let Some(first) = parts.first() else {
        return Ok(Matrix::zeros(0));
    };
    let mut total = first.as_dmatrix().clone();
    for part in &parts[1..] {
        if part.dim() != first.dim() {
            return Err(DimensionMismatch {
                left: first.dim(),
                right: part.dim(),
            });
        }
        total += part.as_dmatrix();
    }
    Ok(Matrix::from_dmatrix(total))
}

// ---------------------------------------------------------------------------
// Rows → Matrix
// ---------------------------------------------------------------------------

fn to_index(value: usize, base: usize, line: usize) -> Result<usize, FormatError> {
    value
        .checked_sub(base)
        .ok_or(FormatError::IndexBase { line, index: value, base })
}

fn numeric_index(row: &Row, field: usize) -> Result<usize, FormatError> {
    let v = row.values[field];
    if !v.is_finite() || v < 0.0 || v.fract() != 0.0 {
        return Err(FormatError::BadLabel {
            line: row.line,
            label: v.to_string(),
            expected: "a matrix index",
        });
    }
    if v >= MAX_DIM as f64 {
        return Err(FormatError::IndexTooLarge {
            line: row.line,
            index: v.to_string(),
            limit: MAX_DIM,
        });
    }
    Ok(v as usize)
}

/// Decode one row of a triples file.
fn triple(row: &Row, index_base: usize) -> Result<(usize, usize, f64), FormatError> {
    let (i, j, value) = match row.label.as_ref() {
        Some(label) => {
            let (i, j) = label.as_index_pair().ok_or_else(|| FormatError::BadLabel {
                line: row.line,
                label: label.to_string(),
                expected: "an index pair",
            })?;
            let value = *row.values.first().ok_or(FormatError::FieldCount {
                line: row.line,
                expected: 1,
                found: 0,
            })?;
            (i, j, value)
        }
        None => {
            if row.values.len() < 3 {
                return Err(FormatError::FieldCount {
                    line: row.line,
                    expected: 3,
                    found: row.values.len(),
                });
            }
            (numeric_index(row, 0)?, numeric_index(row, 1)?, row.values[2])
        }
    };
    Ok((
        to_index(i, index_base, row.line)?,
        to_index(j, index_base, row.line)?,
        value,
    ))
}

/// Assemble a matrix from parsed rows according to `spec`.
pub fn build_matrix<I>(rows: I, spec: &MatrixSpec) -> Result<Matrix, FormatError>
where
    I: IntoIterator<Item = Result<Row, FormatError>>,
{
    let matrix = match spec.layout {
        MatrixLayout::Dense => {
            let dense = rows
                .into_iter()
                .map(|r| r.map(|row| row.values))
                .collect::<Result<Vec<_>, _>>()?;
            if dense.is_empty() {
                return Err(FormatError::NoRows);
            }
            Matrix::from_rows(&dense)?
        }
        MatrixLayout::Triples {
            index_base,
            symmetric,
        } => {
            let mut assembler = MatrixAssembler::new().symmetric(symmetric);
            for row in rows {
                let row = row?;
                let (i, j, v) = triple(&row, index_base)?;
                assembler
                    .insert(i, j, v)
                    .map_err(|e| FormatError::IndexTooLarge {
                        line: row.line,
                        index: e.index.to_string(),
                        limit: e.limit,
                    })?;
            }
            if assembler.dim() == 0 {
                return Err(FormatError::NoRows);
            }
            assembler.finish()
        }
    };
    Ok(if spec.scale == 1.0 {
        matrix
    } else {
        matrix.scaled(spec.scale)
    })
}

/// Read and assemble a matrix file.
pub fn load_matrix(path: &Path, spec: &MatrixSpec) -> Result<Matrix> {
    let rows = open_rows(path, &spec.format)?;
    build_matrix(rows, spec).with_context(|| format!("reading matrix {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::loader::{rows, Delimiter};

    #[test]
    fn assembler_sizes_to_largest_index() {
        let mut a = MatrixAssembler::new();
        a.insert(0, 0, 1.0).unwrap();
        a.insert(2, 1, 5.0).unwrap();
        let m = a.finish();
        assert_eq!(m.dim(), 3);
        assert_eq!(m.get(2, 1), 5.0);
        assert_eq!(m.get(1, 2), 0.0);
    }

    #[test]
    fn symmetric_assembler_mirrors_missing_triangle() {
        let mut a = MatrixAssembler::new().symmetric(true);
        for (i, j, v) in [(0, 0, 1.0), (0, 1, 0.5), (1, 1, 2.0), (1, 0, 0.25)] {
            a.insert(i, j, v).unwrap();
        }
        let m = a.finish();
        // both triangles given explicitly: no mirroring
        assert_eq!(m.get(1, 0), 0.25);
        assert_eq!(m.get(0, 1), 0.5);

        let mut b = MatrixAssembler::new().symmetric(true);
        b.insert(0, 1, 0.5).unwrap();
        assert_eq!(b.finish().get(1, 0), 0.5);
    }

    #[test]
    fn oversized_indices_are_rejected() {
        let mut a = MatrixAssembler::new();
        assert_eq!(
            a.insert(usize::MAX, 0, 1.0),
            Err(IndexLimit {
                index: usize::MAX,
                limit: MAX_DIM,
            })
        );
        assert_eq!(a.dim(), 0);

        let numeric = MatrixSpec {
            format: TableFormat {
                delimiter: Delimiter::Whitespace,
                label: false,
                ..TableFormat::default()
            },
            layout: MatrixLayout::Triples {
                index_base: 0,
                symmetric: false,
            },
            kind: MatrixKind::Covariance,
            scale: 1.0,
        };
        let text = "0 0 1.0\n1e30 0 2.0\n";
        assert!(matches!(
            build_matrix(rows(text.as_bytes(), &numeric.format), &numeric),
            Err(FormatError::IndexTooLarge { line: 2, .. })
        ));

        let labeled = MatrixSpec {
            format: TableFormat {
                delimiter: Delimiter::Pipe,
                fields: Some(1),
                ..TableFormat::default()
            },
            layout: MatrixLayout::Triples {
                index_base: 0,
                symmetric: true,
            },
            ..numeric
        };
        let text = "0-0|1.0\n18446744073709551615-0|2.0\n";
        assert!(matches!(
            build_matrix(rows(text.as_bytes(), &labeled.format), &labeled),
            Err(FormatError::IndexTooLarge { line: 2, .. })
        ));
    }

    #[test]
    fn combine_rejects_mismatched_dimensions() {
        let a = Matrix::zeros(2);
        let b = Matrix::zeros(3);
        assert_eq!(
            combine(&[&a, &b]).unwrap_err(),
            DimensionMismatch { left: 2, right: 3 }
        );
    }

    #[test]
    fn labeled_triples_with_one_based_indices() {
        let spec = MatrixSpec {
            format: TableFormat {
                delimiter: Delimiter::Pipe,
                fields: Some(1),
                ..TableFormat::default()
            },
            layout: MatrixLayout::Triples {
                index_base: 1,
                symmetric: false,
            },
            kind: MatrixKind::Covariance,
            scale: 1.0,
        };
        let text = "element|cov\n1-1|4.0\n1-2|1.0\n2-1|1.0\n2-2|9.0\n";
        let m = build_matrix(rows(text.as_bytes(), &spec.format), &spec).unwrap();
        assert_eq!(m.dim(), 2);
        assert_eq!(m.diagonal(), vec![4.0, 9.0]);

        let zero_index = "0-0|1.0\n";
        assert!(matches!(
            build_matrix(rows(zero_index.as_bytes(), &spec.format), &spec),
            Err(FormatError::IndexBase { .. })
        ));
    }

    #[test]
    fn dense_rows_skip_the_label_column() {
        let spec = MatrixSpec {
            format: TableFormat::default(),
            layout: MatrixLayout::Dense,
            kind: MatrixKind::Covariance,
            scale: 2.0,
        };
        let text = "0-1;1.0;0.5\n1-2;0.5;4.0\n";
        let m = build_matrix(rows(text.as_bytes(), &spec.format), &spec).unwrap();
        assert_eq!(m.to_row_major(), vec![2.0, 1.0, 1.0, 8.0]);
    }
}
