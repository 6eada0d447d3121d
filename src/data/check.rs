use log::warn;
use serde::{Deserialize, Serialize};

use super::model::{Matrix, Table};
use crate::error::DimensionMismatch;

/// What to do when a published covariance disagrees with the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    /// Log and carry on.
    #[default]
    Warn,
    /// Abort the conversion.
    Fail,
}

/// A diagonal element that disagrees with the table uncertainty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mismatch {
    pub index: usize,
    /// Table uncertainty squared.
    pub expected: f64,
    /// Covariance diagonal.
    pub actual: f64,
    /// `|expected - actual| / expected`.
    pub relative: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConsistencyReport {
    pub tolerance: f64,
    pub checked: usize,
    pub mismatches: Vec<Mismatch>,
    /// Set when the table and the matrix don't even have the same size.
    pub size_mismatch: Option<DimensionMismatch>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.size_mismatch.is_none()
    }
}

/// Compares a derived covariance diagonal against `uncertainty²` from the table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsistencyChecker {
    tolerance: f64,
    scale: f64,
}

impl Default for ConsistencyChecker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TOLERANCE)
    }
}

impl ConsistencyChecker {
    pub const DEFAULT_TOLERANCE: f64 = 1e-3;

    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            scale: 1.0,
        }
    }

    /// Multiply table uncertainties by `scale` before squaring, for tables
    /// and matrices quoted in different units.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// `|expected - actual| / expected`; zero against zero is a match.
    pub fn relative_difference(expected: f64, actual: f64) -> f64 {
        if expected == 0.0 {
            return if actual == 0.0 { 0.0 } else { f64::INFINITY };
        }
        (expected - actual).abs() / expected.abs()
    }

    pub fn check(&self, table: &Table, total: &Matrix) -> ConsistencyReport {
        let mut report = ConsistencyReport {
            tolerance: self.tolerance,
            ..ConsistencyReport::default()
        };
        if table.len() != total.dim() {
            warn!(
                "table has {} bins but covariance is {}x{}",
                table.len(),
                total.dim(),
                total.dim()
            );
            report.size_mismatch = Some(DimensionMismatch {
                left: table.len(),
                right: total.dim(),
            });
        }

        let n = table.len().min(total.dim());
        for (index, bin) in table.bins().iter().take(n).enumerate() {
            let u = bin.uncertainty * self.scale;
            let expected = u * u;
            let actual = total.get(index, index);
            let relative = Self::relative_difference(expected, actual);
            report.checked += 1;
            if relative.is_nan() || relative > self.tolerance {
                warn!(
                    "bin {index}: uncertainty² = {expected:e} but covariance diagonal = {actual:e} (relative difference {relative:.3e})"
                );
                report.mismatches.push(Mismatch {
                    index,
                    expected,
                    actual,
                    relative,
                });
            }
        }
        report
    }
}
