use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("matrix is not square: {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("matrix contains NaN or Inf values")]
    NonFiniteInput,
    #[error("triangular system is singular at row {row}")]
    SingularTriangular { row: usize },
}

#[inline]
fn check_square_finite<S: Data<Elem = f64>>(
    array: &ArrayBase<S, Ix2>,
) -> Result<(), FaerLinalgError> {
    let (rows, cols) = array.dim();
    if rows != cols {
        return Err(FaerLinalgError::NotSquare { rows, cols });
    }
    if !array.iter().all(|v| v.is_finite()) {
        return Err(FaerLinalgError::NonFiniteInput);
    }
    Ok(())
}

/// Copy an ndarray matrix into an owned faer matrix.
///
/// The samplers only decompose `m x m` precision matrices with `m` the basis
/// width, so the copy is negligible next to the factorization itself.
#[inline]
pub fn array_to_mat<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> Mat<f64> {
    Mat::from_fn(array.nrows(), array.ncols(), |i, j| array[[i, j]])
}

#[inline]
fn array_to_col<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix1>) -> Mat<f64> {
    Mat::from_fn(array.len(), 1, |i, _| array[i])
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    let mut out = Array1::<f64>::zeros(mat.nrows());
    for i in 0..mat.nrows() {
        out[i] = mat[(i, 0)];
    }
    out
}

pub trait FaerEigh {
    /// Eigenvalues (ascending) and eigenvectors (columns) of a symmetric matrix.
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        check_square_finite(self)?;
        let mat = array_to_mat(self);
        let eigen = mat
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut col = array_to_col(rhs);
        self.factor.solve_in_place(col.as_mut());
        Array1::from_iter((0..col.nrows()).map(|i| col[(i, 0)]))
    }

    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.factor.L().diagonal())
    }

    /// `log|A|` for the factored matrix `A = L Lᵀ`.
    pub fn log_det(&self) -> f64 {
        2.0 * self.diag().iter().map(|d| d.ln()).sum::<f64>()
    }

    pub fn lower_triangular(&self) -> Array2<f64> {
        mat_to_array(self.factor.L())
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        check_square_finite(self)?;
        let mat = array_to_mat(self);
        let factor = mat.as_ref().llt(side).map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

pub trait FaerQr {
    fn qr(&self) -> Result<(Array2<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerQr for ArrayBase<S, Ix2> {
    fn qr(&self) -> Result<(Array2<f64>, Array2<f64>), FaerLinalgError> {
        if !self.iter().all(|v| v.is_finite()) {
            return Err(FaerLinalgError::NonFiniteInput);
        }
        let mat = array_to_mat(self);
        let qr = mat.as_ref().qr();
        let q = qr.compute_Q();
        let r = qr.R();
        Ok((mat_to_array(q.as_ref()), mat_to_array(r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn eigh_reconstructs_symmetric_matrix() {
        let a = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let (vals, vecs) = a.eigh(Side::Lower).expect("eigh");
        let rebuilt = vecs.dot(&Array2::from_diag(&vals)).dot(&vecs.t());
        for (x, y) in rebuilt.iter().zip(a.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
        }
        assert!(vals.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn cholesky_solves_and_reports_log_det() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let chol = a.cholesky(Side::Lower).expect("cholesky");
        let x = chol.solve_vec(&array![1.0, 2.0]);
        let back = a.dot(&x);
        assert_abs_diff_eq!(back[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(back[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(chol.log_det(), 8.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(
            a.cholesky(Side::Lower),
            Err(FaerLinalgError::Cholesky(_))
        ));
    }

    #[test]
    fn qr_factors_multiply_back() {
        let a = array![[2.0, -1.0], [1.0, 3.0]];
        let (q, r) = a.qr().expect("qr");
        let back = q.dot(&r);
        for (x, y) in back.iter().zip(a.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(r[[1, 0]], 0.0, epsilon = 1e-14);
    }

    #[test]
    fn decompositions_reject_non_finite_input() {
        let a = array![[1.0, f64::NAN], [f64::NAN, 1.0]];
        assert!(matches!(
            a.eigh(Side::Lower),
            Err(FaerLinalgError::NonFiniteInput)
        ));
        assert!(matches!(
            a.cholesky(Side::Lower),
            Err(FaerLinalgError::NonFiniteInput)
        ));
    }
}
