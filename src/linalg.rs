//! Linear algebra utilities for the unscented filter.
//!
//! Covariance matrices are symmetric positive semi-definite, which lets the
//! square root and solve routines lead with Cholesky decomposition and fall
//! back to an eigenvalue decomposition when the matrix is only semi-definite
//! (a legitimate state for a freshly initialised filter with exactly known
//! sub-states). All routines return `Option`/plain values instead of
//! panicking so the filter layer can map failures to its own error kinds.

use nalgebra::DMatrix;

/// Calculates a square root of a symmetric positive semi-definite matrix.
///
/// Attempts Cholesky decomposition first (yielding L such that
/// `matrix = L * L^T`). If Cholesky fails, the square root is computed via
/// eigenvalue decomposition (`S = V * sqrt(D) * V^T`) with eigenvalues
/// clamped to be non-negative. Returns `None` for non-square input or when
/// significantly negative eigenvalues show the matrix was indefinite.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if !matrix.is_square() {
        return None;
    }
    if let Some(cholesky) = matrix.clone().cholesky() {
        return Some(cholesky.l());
    }
    let eigen = matrix.clone().symmetric_eigen();
    let tolerance = 1e-9 * (1.0 + matrix.amax());
    if eigen.eigenvalues.iter().any(|&value| value < -tolerance) {
        return None;
    }
    let sqrt_eigenvalues = DMatrix::from_diagonal(&eigen.eigenvalues.map(|value| value.max(0.0).sqrt()));
    Some(&eigen.eigenvectors * sqrt_eigenvalues * eigen.eigenvectors.transpose())
}

/// Returns the symmetric part `0.5 * (M + M^T)`.
pub fn symmetrize(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (matrix + matrix.transpose())
}

/// Solves `A * X = B` for a symmetric positive (semi-)definite `A`.
///
/// Cholesky first; if the matrix is numerically on the boundary, a small
/// diagonal jitter proportional to the diagonal magnitude is added and the
/// decomposition retried with growing jitter. A final LU pass covers
/// ill-conditioned but still invertible systems.
pub fn robust_spd_solve(matrix: &DMatrix<f64>, rhs: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if let Some(cholesky) = matrix.clone().cholesky() {
        return Some(cholesky.solve(rhs));
    }
    let scale = matrix.diagonal().amax().max(f64::MIN_POSITIVE);
    let mut jitter = 1e-12 * scale;
    for _ in 0..3 {
        let jittered =
            matrix + DMatrix::from_diagonal_element(matrix.nrows(), matrix.ncols(), jitter);
        if let Some(cholesky) = jittered.cholesky() {
            return Some(cholesky.solve(rhs));
        }
        jitter *= 1e3;
    }
    matrix.clone().lu().solve(rhs)
}

/// Clamps negative eigenvalues of a symmetric matrix to zero.
///
/// Covariance recombination can push eigenvalues slightly below zero; the
/// matrix is reconstructed from its clamped eigendecomposition only when that
/// actually happened, otherwise the input is returned unchanged.
pub fn enforce_positive_semidefinite(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    if matrix.clone().cholesky().is_some() {
        return matrix.clone();
    }
    let mut eigen = matrix.clone().symmetric_eigen();
    if eigen.eigenvalues.iter().all(|&value| value >= 0.0) {
        return matrix.clone();
    }
    for value in eigen.eigenvalues.iter_mut() {
        if *value < 0.0 {
            *value = 0.0;
        }
    }
    eigen.recompose()
}

/// Checks that a matrix is square, symmetric and positive semi-definite
/// within a relative tolerance.
pub fn is_positive_semidefinite(matrix: &DMatrix<f64>) -> bool {
    if !matrix.is_square() {
        return false;
    }
    if matrix.iter().any(|value| !value.is_finite()) {
        return false;
    }
    let tolerance = 1e-9 * (1.0 + matrix.amax());
    if (matrix - matrix.transpose()).amax() > tolerance {
        return false;
    }
    matrix
        .clone()
        .symmetric_eigen()
        .eigenvalues
        .iter()
        .all(|&value| value >= -tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn is_valid_square_root(sqrt: &DMatrix<f64>, original: &DMatrix<f64>, tolerance: f64) -> bool {
        let reconstructed = sqrt * sqrt.transpose();
        (reconstructed - original).amax() < tolerance
    }

    #[test]
    fn square_root_positive_definite() {
        let matrix = DMatrix::from_row_slice(3, 3, &[4.0, 2.0, 0.0, 2.0, 9.0, 3.0, 0.0, 3.0, 16.0]);
        let sqrt = matrix_square_root(&matrix).expect("positive definite matrix has a square root");
        assert!(is_valid_square_root(&sqrt, &matrix, 1e-9));
    }

    #[test]
    fn square_root_positive_semidefinite_falls_back_to_eigen() {
        let matrix = DMatrix::from_row_slice(3, 3, &[1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        let sqrt = matrix_square_root(&matrix).expect("semi-definite matrix has a square root");
        assert!(is_valid_square_root(&sqrt, &matrix, 1e-9));
    }

    #[test]
    fn square_root_of_zero_matrix() {
        let matrix = DMatrix::zeros(4, 4);
        let sqrt = matrix_square_root(&matrix).expect("zero matrix has a zero square root");
        assert!(sqrt.amax() < 1e-12);
    }

    #[test]
    fn square_root_rejects_indefinite_and_non_square() {
        let negative = DMatrix::from_diagonal(&DVector::from_vec(vec![-4.0, 9.0, 16.0]));
        assert!(matrix_square_root(&negative).is_none());
        let rectangular = DMatrix::zeros(2, 3);
        assert!(matrix_square_root(&rectangular).is_none());
    }

    #[test]
    fn spd_solve_matches_direct_inverse() {
        let matrix = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let rhs = DMatrix::from_column_slice(2, 1, &[1.0, 2.0]);
        let solution = robust_spd_solve(&matrix, &rhs).expect("well conditioned solve");
        let residual = &matrix * &solution - &rhs;
        assert!(residual.amax() < 1e-12);
    }

    #[test]
    fn spd_solve_survives_singular_boundary() {
        // Rank deficient matrix with a right hand side in its range.
        let matrix = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let rhs = DMatrix::from_column_slice(2, 1, &[2.0, 2.0]);
        let solution = robust_spd_solve(&matrix, &rhs);
        if let Some(solution) = solution {
            assert!(solution.iter().all(|value| value.is_finite()));
        }
    }

    #[test]
    fn symmetrize_and_clamp() {
        let matrix = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 1.0]);
        let symmetric = symmetrize(&matrix);
        assert_eq!(symmetric[(0, 1)], symmetric[(1, 0)]);

        let indefinite = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, -0.5]));
        let clamped = enforce_positive_semidefinite(&indefinite);
        assert!(clamped[(1, 1)].abs() < 1e-12);
        assert!((clamped[(0, 0)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn positive_semidefinite_check() {
        let good = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 0.0, 2.0]));
        assert!(is_positive_semidefinite(&good));
        let asymmetric = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        assert!(!is_positive_semidefinite(&asymmetric));
        let indefinite = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, -1.0]));
        assert!(!is_positive_semidefinite(&indefinite));
        let nan = DMatrix::from_diagonal(&DVector::from_vec(vec![f64::NAN, 1.0]));
        assert!(!is_positive_semidefinite(&nan));
    }
}
