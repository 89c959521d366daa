use crate::types::{ParamDescriptor, SignalKind};
use ndarray::{Array1, Array2, ArrayView1};
use std::borrow::Cow;
use std::ops::Range;

/// One additive component of a pulsar's noise model.
pub trait Signal {
    fn name(&self) -> &str;

    fn kind(&self) -> SignalKind;

    /// Columns of the model basis owned by this signal, if it has a basis.
    fn basis_columns(&self) -> Option<Range<usize>>;

    /// Prior variance of each of this signal's basis coefficients, one entry
    /// per column in `basis_columns`.
    fn prior_variance(&self, x: ArrayView1<'_, f64>) -> Array1<f64>;
}

/// Gaussian-process noise model of a single pulsar.
///
/// Every method that takes `x` receives the flat parameter vector in
/// declaration order of [`NoiseModel::parameters`].
pub trait NoiseModel {
    fn pulsar_name(&self) -> &str;

    fn parameters(&self) -> &[ParamDescriptor];

    fn signals(&self) -> Vec<&dyn Signal>;

    fn residuals(&self) -> ArrayView1<'_, f64>;

    /// Basis matrix `T` (TOAs x coefficients).
    fn basis(&self, x: ArrayView1<'_, f64>) -> Cow<'_, Array2<f64>>;

    /// Diagonal of the white-noise covariance `N`.
    fn noise_diagonal(&self, x: ArrayView1<'_, f64>) -> Array1<f64>;

    /// Diagonal of `φ⁻¹`.
    fn inverse_prior_diag(&self, x: ArrayView1<'_, f64>) -> Array1<f64>;

    /// Diagonal of `φ⁻¹` together with `log|φ|`.
    fn inverse_prior_diag_with_logdet(&self, x: ArrayView1<'_, f64>) -> (Array1<f64>, f64);

    fn log_prior(&self, x: ArrayView1<'_, f64>) -> f64 {
        let mut offset = 0;
        let mut total = 0.0;
        for param in self.parameters() {
            for k in 0..param.size {
                total += param.prior.log_pdf(x[offset + k]);
            }
            offset += param.size;
        }
        total
    }

    /// Width of the basis as reported by the model itself.
    fn basis_width(&self) -> usize {
        let zeros = Array1::<f64>::zeros(self.parameters().iter().map(|p| p.size).sum::<usize>());
        self.basis(zeros.view()).ncols()
    }
}
