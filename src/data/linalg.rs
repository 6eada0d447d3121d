//! Covariance matrix transforms. The heavy lifting (SVD) is nalgebra's.

use nalgebra::{DMatrix, DVector};

use super::model::Matrix;
use crate::error::{DimensionMismatch, LinalgError};

/// Singular values below this fraction of the largest are treated as zero
/// when inverting.
pub const SVD_TOLERANCE: f64 = 1.6e-20;

fn check_len(m: &Matrix, len: usize) -> Result<(), DimensionMismatch> {
    if m.dim() != len {
        return Err(DimensionMismatch {
            left: m.dim(),
            right: len,
        });
    }
    Ok(())
}

/// `r_ij = c_ij / sqrt(c_ii c_jj)`; rows/columns with a zero variance stay zero.
pub fn covariance_to_correlation(cov: &Matrix) -> Matrix {
    let n = cov.dim();
    let sigma: Vec<f64> = cov.diagonal().iter().map(|&v| v.max(0.0).sqrt()).collect();
    let mut corr = Matrix::zeros(n);
    for i in 0..n {
        for j in 0..n {
            let denom = sigma[i] * sigma[j];
            if denom > 0.0 {
                corr.set(i, j, cov.get(i, j) / denom);
            }
        }
    }
    corr
}

/// `c_ij = r_ij σ_i σ_j`.
pub fn correlation_to_covariance(corr: &Matrix, errors: &[f64]) -> Result<Matrix, DimensionMismatch> {
    check_len(corr, errors.len())?;
    let n = corr.dim();
    let mut cov = Matrix::zeros(n);
    for i in 0..n {
        for j in 0..n {
            cov.set(i, j, corr.get(i, j) * errors[i] * errors[j]);
        }
    }
    Ok(cov)
}

/// Uncorrelated covariance from per-bin errors.
pub fn diagonal_covariance(errors: &[f64]) -> Matrix {
    let variances: Vec<f64> = errors.iter().map(|e| e * e).collect();
    Matrix::from_diagonal(&variances)
}

/// Copy keeping only the diagonal.
pub fn diagonal_only(m: &Matrix) -> Matrix {
    Matrix::from_diagonal(&m.diagonal())
}

/// Inverse via SVD pseudo-inverse. Diagonal matrices are inverted
/// element-wise, leaving zero entries at zero.
pub fn invert(m: &Matrix) -> Result<Matrix, LinalgError> {
    if m.dim() == 0 {
        return Ok(m.clone());
    }
    if m.is_diagonal() || m.dim() == 1 {
        let inv: Vec<f64> = m
            .diagonal()
            .iter()
            .map(|&v| if v != 0.0 { 1.0 / v } else { 0.0 })
            .collect();
        return Ok(Matrix::from_diagonal(&inv));
    }
    let svd = m.as_dmatrix().clone().svd(true, true);
    let eps = SVD_TOLERANCE * svd.singular_values.max();
    let inv = svd
        .pseudo_inverse(eps)
        .map_err(LinalgError::Decomposition)?;
    Ok(Matrix::from_dmatrix(inv))
}

/// `inverse · m`, which should be the identity for a well-conditioned matrix.
pub fn identity_check(inverse: &Matrix, m: &Matrix) -> Result<Matrix, DimensionMismatch> {
    check_len(inverse, m.dim())?;
    Ok(Matrix::from_dmatrix(inverse.as_dmatrix() * m.as_dmatrix()))
}

/// Symmetric square root `V · diag(sqrt σ) · Vᵀ` of a covariance.
pub fn decompose(m: &Matrix) -> Result<Matrix, LinalgError> {
    if m.dim() == 0 {
        return Ok(m.clone());
    }
    if m.is_diagonal() || m.dim() == 1 {
        let roots: Vec<f64> = m
            .diagonal()
            .iter()
            .map(|&v| if v > 0.0 { v.sqrt() } else { 0.0 })
            .collect();
        return Ok(Matrix::from_diagonal(&roots));
    }
    let svd = m.as_dmatrix().clone().svd(false, true);
    let v_t = svd
        .v_t
        .ok_or(LinalgError::Decomposition("right singular vectors not computed"))?;
    let roots: DVector<f64> = svd.singular_values.map(|s| s.max(0.0).sqrt());
    let root: DMatrix<f64> = v_t.transpose() * DMatrix::from_diagonal(&roots) * &v_t;
    Ok(Matrix::from_dmatrix(root))
}

/// Remove the overall normalization component from a total covariance.
pub fn shape_only(cov: &Matrix, data: &[f64]) -> Result<Matrix, LinalgError> {
    check_len(cov, data.len())?;
    let n = cov.dim();
    let total_data: f64 = data.iter().sum();
    let total_cov: f64 = cov.as_dmatrix().sum();
    if total_data == 0.0 || total_cov == 0.0 {
        return Err(LinalgError::Degenerate);
    }

    let row_sums: Vec<f64> = (0..n).map(|i| (0..n).map(|k| cov.get(i, k)).sum()).collect();
    let col_sums: Vec<f64> = (0..n).map(|j| (0..n).map(|k| cov.get(k, j)).sum()).collect();
    let td2 = total_data * total_data;

    let mut shape = Matrix::zeros(n);
    for i in 0..n {
        for j in 0..n {
            let (di, dj) = (data[i], data[j]);
            let norm_term = di * dj * total_cov / td2;
            let mix1 = di * (col_sums[j] / total_data - total_cov * dj / td2);
            let mix2 = dj * (row_sums[i] / total_data - total_cov * di / td2);
            shape.set(i, j, cov.get(i, j) - mix1 - mix2 - norm_term);
        }
    }
    Ok(shape)
}

/// Fold a fractional normalization uncertainty into a covariance:
/// `c_ij + norm² d_i d_j`.
pub fn with_normalization(cov: &Matrix, data: &[f64], norm: f64) -> Result<Matrix, DimensionMismatch> {
    check_len(cov, data.len())?;
    let n = cov.dim();
    let mut out = cov.clone();
    for i in 0..n {
        for j in 0..n {
            out.set(i, j, cov.get(i, j) + norm * norm * data[i] * data[j]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Matrix {
        Matrix::from_rows(&[
            vec![4.0, 1.0, 0.5],
            vec![1.0, 9.0, 1.5],
            vec![0.5, 1.5, 16.0],
        ])
        .unwrap()
    }

    fn assert_close(a: &Matrix, b: &Matrix, tol: f64) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.to_row_major().iter().zip(b.to_row_major()) {
            assert!((x - y).abs() < tol, "{x} vs {y}");
        }
    }

    #[test]
    fn correlation_roundtrip_through_errors() {
        let cov = sample();
        let corr = covariance_to_correlation(&cov);
        assert_eq!(corr.diagonal(), vec![1.0, 1.0, 1.0]);
        assert!((corr.get(0, 1) - 1.0 / 6.0).abs() < 1e-12);
        let back = correlation_to_covariance(&corr, &[2.0, 3.0, 4.0]).unwrap();
        assert_close(&back, &cov, 1e-12);
    }

    #[test]
    fn inverse_times_matrix_is_identity() {
        let cov = sample();
        let inv = invert(&cov).unwrap();
        let ident = identity_check(&inv, &cov).unwrap();
        assert_close(&ident, &Matrix::from_diagonal(&[1.0, 1.0, 1.0]), 1e-10);
    }

    #[test]
    fn diagonal_inverse_keeps_zeros() {
        let inv = invert(&Matrix::from_diagonal(&[2.0, 0.0])).unwrap();
        assert_eq!(inv.diagonal(), vec![0.5, 0.0]);
    }

    #[test]
    fn decomposition_squares_back() {
        let cov = sample();
        let root = decompose(&cov).unwrap();
        let square = Matrix::from_dmatrix(root.as_dmatrix() * root.as_dmatrix());
        assert_close(&square, &cov, 1e-9);
    }

    #[test]
    fn shape_only_removes_normalization() {
        let data = [1.0, 2.0, 3.0];
        let base = Matrix::from_diagonal(&[0.1, 0.2, 0.3]);
        let total = with_normalization(&base, &data, 0.1).unwrap();
        let shape = shape_only(&total, &data).unwrap();
        // a shape-only covariance has vanishing row sums
        for i in 0..3 {
            let row: f64 = (0..3).map(|j| shape.get(i, j)).sum();
            assert!(row.abs() < 1e-12, "row {i} sums to {row}");
        }
    }
}
