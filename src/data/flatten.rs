use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::loader::{Row, TableFormat};
use super::model::{BinAxis, Histogram1D, Histogram2D, RowLabel};
use crate::error::FormatError;

// ---------------------------------------------------------------------------
// Bin map: which 2D cells take part in the flattened 1D array
// ---------------------------------------------------------------------------

/// Maps each 2D cell to a position in the flattened array.
/// Cells that are absent from the map are dropped when flattening.
#[derive(Debug, Clone, PartialEq)]
pub struct BinMap {
    nx: usize,
    ny: usize,
    /// x-major, `None` = not mapped.
    slots: Vec<Option<usize>>,
}

impl BinMap {
    pub fn empty(nx: usize, ny: usize) -> Self {
        Self {
            nx,
            ny,
            slots: vec![None; nx * ny],
        }
    }

    /// Number cells with positive content sequentially in x-major order.
    pub fn generate(hist: &Histogram2D) -> Self {
        let (nx, ny) = (hist.x_axis.n_bins(), hist.y_axis.n_bins());
        let mut map = Self::empty(nx, ny);
        let mut next = 0;
        for ix in 0..nx {
            for iy in 0..ny {
                if hist.get(ix, iy) > 0.0 {
                    map.assign(ix, iy, next);
                    next += 1;
                }
            }
        }
        map
    }

    pub fn assign(&mut self, ix: usize, iy: usize, flat: usize) {
        self.slots[ix * self.ny + iy] = Some(flat);
    }

    pub fn get(&self, ix: usize, iy: usize) -> Option<usize> {
        self.slots[ix * self.ny + iy]
    }

    /// Length of the flattened array.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().map(|&i| i + 1).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The map as a 2D histogram holding 1-based flat indices (0 = unmapped).
    pub fn to_histogram(&self, name: &str, x_axis: BinAxis, y_axis: BinAxis) -> Histogram2D {
        let mut hist = Histogram2D::zeros(name, name, x_axis, y_axis);
        for ix in 0..self.nx {
            for iy in 0..self.ny {
                if let Some(flat) = self.get(ix, iy) {
                    hist.set(ix, iy, (flat + 1) as f64, 0.0);
                }
            }
        }
        hist
    }
}

/// Copy mapped cells of `hist` into a 1D histogram over flat indices.
pub fn flatten(hist: &Histogram2D, map: &BinMap, name: &str) -> Histogram1D {
    let mut flat = Histogram1D::zeros(name, &hist.title, BinAxis::indices(map.len()));
    for ix in 0..map.nx {
        for iy in 0..map.ny {
            if let Some(i) = map.get(ix, iy) {
                flat.contents[i] = hist.get(ix, iy);
                flat.errors[i] = hist.error(ix, iy);
            }
        }
    }
    flat
}

/// Inverse of [`flatten`]: write flat values back into the mapped cells.
pub fn unflatten(target: &mut Histogram2D, flat: &Histogram1D, map: &BinMap) {
    target.contents.iter_mut().for_each(|v| *v = 0.0);
    target.errors.iter_mut().for_each(|v| *v = 0.0);
    for ix in 0..map.nx {
        for iy in 0..map.ny {
            if let Some(i) = map.get(ix, iy) {
                target.set(ix, iy, flat.contents[i], flat.errors[i]);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rows → 2D grid
// ---------------------------------------------------------------------------

/// A two-dimensional measurement given as one row per cell. Each axis is
/// located either by a pair of edge fields or by a single `"low - high"`
/// range field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    #[serde(default)]
    pub format: TableFormat,
    pub x_edges: Vec<f64>,
    pub y_edges: Vec<f64>,
    #[serde(default)]
    pub x_low: Option<usize>,
    #[serde(default)]
    pub x_high: Option<usize>,
    #[serde(default)]
    pub y_low: Option<usize>,
    #[serde(default)]
    pub y_high: Option<usize>,
    #[serde(default)]
    pub x_range: Option<usize>,
    #[serde(default)]
    pub y_range: Option<usize>,
    pub value: usize,
    #[serde(default)]
    pub uncertainty: Option<usize>,
    #[serde(default = "unit_scale")]
    pub scale: f64,
    /// Base of the flat bin numbers in the row labels, when labels are indices.
    #[serde(default)]
    pub index_base: usize,
}

fn unit_scale() -> f64 {
    1.0
}

impl GridSpec {
    /// The row format, with range cells enabled when an axis uses them.
    pub fn row_format(&self) -> TableFormat {
        let mut format = self.format.clone();
        if self.x_range.is_some() || self.y_range.is_some() {
            format.range_cells = true;
        }
        format
    }
}

/// A filled 2D histogram plus the map used to flatten it.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub hist: Histogram2D,
    pub map: BinMap,
}

fn field(row: &Row, index: usize) -> Result<f64, FormatError> {
    row.values.get(index).copied().ok_or(FormatError::FieldCount {
        line: row.line,
        expected: index + 1,
        found: row.values.len(),
    })
}

/// Centre of one cell along an axis.
fn centre(
    row: &Row,
    range: Option<usize>,
    low: Option<usize>,
    high: Option<usize>,
    axis: &'static str,
) -> Result<f64, FormatError> {
    match (range, low, high) {
        (Some(j), _, _) => {
            let (lo, hi) = row.range(j).ok_or_else(|| FormatError::BadLabel {
                line: row.line,
                label: row.values.get(j).map_or_else(String::new, f64::to_string),
                expected: "a bin range",
            })?;
            Ok(0.5 * (lo + hi))
        }
        (None, Some(lo), Some(hi)) => Ok(0.5 * (field(row, lo)? + field(row, hi)?)),
        _ => Err(FormatError::MissingColumns { axis }),
    }
}

/// Fill a grid from rows. Flat indices come from integer row labels when
/// present, otherwise from row order. A cell or flat index given twice is an
/// error.
pub fn build_grid<I>(rows: I, spec: &GridSpec) -> Result<Grid, FormatError>
where
    I: IntoIterator<Item = Result<Row, FormatError>>,
{
    let x_axis = BinAxis::new(spec.x_edges.clone())?;
    let y_axis = BinAxis::new(spec.y_edges.clone())?;
    let cells = x_axis.n_bins() * y_axis.n_bins();
    let mut map = BinMap::empty(x_axis.n_bins(), y_axis.n_bins());
    let mut hist = Histogram2D::zeros("", "", x_axis, y_axis);
    let mut used = HashSet::new();

    let mut count = 0;
    for (order, row) in rows.into_iter().enumerate() {
        let row = row?;
        let x = centre(&row, spec.x_range, spec.x_low, spec.x_high, "x")?;
        let y = centre(&row, spec.y_range, spec.y_low, spec.y_high, "y")?;
        let value = field(&row, spec.value)? * spec.scale;
        let error = match spec.uncertainty {
            Some(u) => field(&row, u)? * spec.scale,
            None => 0.0,
        };
        let (Some(ix), Some(iy)) = (hist.x_axis.find_bin(x), hist.y_axis.find_bin(y)) else {
            return Err(FormatError::OutsideGrid { line: row.line, x, y });
        };
        let flat = match row.label.as_ref().and_then(RowLabel::as_index) {
            Some(i) => {
                let i = usize::try_from(i).map_err(|_| FormatError::BadLabel {
                    line: row.line,
                    label: i.to_string(),
                    expected: "a bin number",
                })?;
                i.checked_sub(spec.index_base).ok_or(FormatError::IndexBase {
                    line: row.line,
                    index: i,
                    base: spec.index_base,
                })?
            }
            None => order,
        };
        if flat >= cells {
            return Err(FormatError::IndexTooLarge {
                line: row.line,
                index: (flat + spec.index_base).to_string(),
                limit: cells,
            });
        }
        if map.get(ix, iy).is_some() {
            return Err(FormatError::DuplicateCell { line: row.line, ix, iy });
        }
        if !used.insert(flat) {
            return Err(FormatError::DuplicateBin {
                line: row.line,
                bin: flat + spec.index_base,
            });
        }
        hist.set(ix, iy, value, error);
        map.assign(ix, iy, flat);
        count += 1;
    }
    if count == 0 {
        return Err(FormatError::NoRows);
    }
    Ok(Grid { hist, map })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::loader::rows;

    fn grid_hist() -> Histogram2D {
        let x = BinAxis::new(vec![0.0, 1.0, 2.0]).unwrap();
        let y = BinAxis::new(vec![0.0, 1.0, 2.0]).unwrap();
        let mut h = Histogram2D::zeros("h", "h", x, y);
        h.set(0, 1, 3.0, 0.3);
        h.set(1, 0, 5.0, 0.5);
        h
    }

    #[test]
    fn generated_map_skips_empty_cells() {
        let h = grid_hist();
        let map = BinMap::generate(&h);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(0, 1), Some(0));
        assert_eq!(map.get(1, 0), Some(1));
        assert_eq!(map.get(0, 0), None);

        let flat = flatten(&h, &map, "flat");
        assert_eq!(flat.contents, vec![3.0, 5.0]);
        assert_eq!(flat.errors, vec![0.3, 0.5]);
    }

    #[test]
    fn unflatten_restores_the_grid() {
        let h = grid_hist();
        let map = BinMap::generate(&h);
        let flat = flatten(&h, &map, "flat");
        let mut back = Histogram2D::zeros("b", "b", h.x_axis.clone(), h.y_axis.clone());
        unflatten(&mut back, &flat, &map);
        assert_eq!(back.contents, h.contents);
    }

    #[test]
    fn grid_rows_use_their_index_labels() {
        let spec = GridSpec {
            format: TableFormat {
                delimiter: crate::data::loader::Delimiter::Pipe,
                ..TableFormat::default()
            },
            x_edges: vec![0.0, 1.0, 2.0],
            y_edges: vec![0.0, 1.0],
            x_low: Some(0),
            x_high: Some(1),
            y_low: Some(2),
            y_high: Some(3),
            x_range: None,
            y_range: None,
            value: 4,
            uncertainty: None,
            scale: 1.0,
            index_base: 1,
        };
        let text = "bin|xlo|xhi|ylo|yhi|xsec\n2|0|1|0|1|7.0\n1|1|2|0|1|8.0\n";
        let grid = build_grid(rows(text.as_bytes(), &spec.format), &spec).unwrap();
        assert_eq!(grid.map.get(0, 0), Some(1));
        assert_eq!(grid.map.get(1, 0), Some(0));
        let flat = flatten(&grid.hist, &grid.map, "flat");
        assert_eq!(flat.contents, vec![8.0, 7.0]);
    }

    fn range_spec() -> GridSpec {
        GridSpec {
            format: TableFormat {
                delimiter: crate::data::loader::Delimiter::Pipe,
                ..TableFormat::default()
            },
            x_edges: vec![0.6, 0.7, 0.8],
            y_edges: vec![0.2, 0.35, 1.0],
            x_low: None,
            x_high: None,
            y_low: None,
            y_high: None,
            x_range: Some(0),
            y_range: Some(1),
            value: 2,
            uncertainty: None,
            scale: 1.0,
            index_base: 1,
        }
    }

    #[test]
    fn range_cells_locate_grid_cells() {
        let spec = range_spec();
        let text = "bin | p_mu | cos | xsec\n\
                    1 | 0.6 - 0.7 | 0.2 - 0.35 | 1.23\n\
                    2 | 0.7 - 0.8 | 0.35 - 1.0 | 0.5\n";
        let grid = build_grid(rows(text.as_bytes(), &spec.row_format()), &spec).unwrap();
        assert_eq!(grid.map.get(0, 0), Some(0));
        assert_eq!(grid.map.get(1, 1), Some(1));
        assert_eq!(grid.hist.get(0, 0), 1.23);

        // the same rows with range cells left off do not parse
        assert!(build_grid(rows(text.as_bytes(), &spec.format), &spec).is_err());

        let neither = GridSpec {
            x_range: None,
            ..range_spec()
        };
        assert_eq!(
            build_grid(rows(text.as_bytes(), &neither.row_format()), &neither).unwrap_err(),
            FormatError::MissingColumns { axis: "x" }
        );
    }

    #[test]
    fn repeated_cells_and_bins_are_rejected() {
        let spec = range_spec();
        let same_cell = "1 | 0.6 - 0.7 | 0.2 - 0.35 | 1.0\n2 | 0.6 - 0.7 | 0.2 - 0.35 | 2.0\n";
        assert_eq!(
            build_grid(rows(same_cell.as_bytes(), &spec.row_format()), &spec).unwrap_err(),
            FormatError::DuplicateCell { line: 2, ix: 0, iy: 0 }
        );

        let same_bin = "1 | 0.6 - 0.7 | 0.2 - 0.35 | 1.0\n1 | 0.7 - 0.8 | 0.2 - 0.35 | 2.0\n";
        assert_eq!(
            build_grid(rows(same_bin.as_bytes(), &spec.row_format()), &spec).unwrap_err(),
            FormatError::DuplicateBin { line: 2, bin: 1 }
        );

        let huge = "99999999999 | 0.6 - 0.7 | 0.2 - 0.35 | 1.0\n";
        assert!(matches!(
            build_grid(rows(huge.as_bytes(), &spec.row_format()), &spec),
            Err(FormatError::IndexTooLarge { line: 1, limit: 4, .. })
        ));
    }
}
