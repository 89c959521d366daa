use crate::gibbs::GibbsError;
use crate::likelihood::IterationCache;
use crate::linalg::faer_ndarray::{FaerEigh, FaerLinalgError, FaerQr};
use crate::linalg::utils::{solve_upper_triangular, symmetrize};
use crate::model::NoiseModel;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1};
use rand_distr::{Distribution, StandardNormal};

/// Gaussian conditional posterior of the latent coefficients, as a mean and
/// a factor `L` with `L Lᵀ = Σ⁻¹`.
#[derive(Debug, Clone)]
pub struct CoefficientPosterior {
    pub mean: Array1<f64>,
    pub factor: Array2<f64>,
    /// Whether the QR fallback produced this posterior.
    pub used_fallback: bool,
}

impl CoefficientPosterior {
    pub fn draw<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Array1<f64> {
        let z: Array1<f64> = Array1::from_shape_fn(self.mean.len(), |_| StandardNormal.sample(rng));
        &self.mean + &self.factor.dot(&z)
    }

    pub fn covariance(&self) -> Array2<f64> {
        self.factor.dot(&self.factor.t())
    }
}

/// Posterior of `b` given `Σ = T'N⁻¹T + diag(φ⁻¹)` and `d = T'N⁻¹r`.
///
/// The eigendecomposition path is used when every eigenvalue of `Σ` is
/// positive and finite. Otherwise `Σ⁻¹ ≈ R⁻¹Qᵀ` from a QR factorization is
/// symmetrized and its eigendecomposition, with negative eigenvalues clipped
/// to zero, provides the factor.
pub fn coefficient_posterior(
    tnt: &Array2<f64>,
    d: &Array1<f64>,
    phiinv: &Array1<f64>,
) -> Result<CoefficientPosterior, FaerLinalgError> {
    let mut sigma = tnt.clone();
    sigma.diag_mut().scaled_add(1.0, phiinv);

    let eigen = sigma
        .eigh(Side::Lower)
        .ok()
        .filter(|(s, _)| s.iter().all(|v| v.is_finite() && *v > 0.0));
    if let Some((s, u)) = eigen {
        let proj = u.t().dot(d) / &s;
        let mean = u.dot(&proj);
        let factor = &u * &s.mapv(|v| 1.0 / v.sqrt());
        return Ok(CoefficientPosterior {
            mean,
            factor,
            used_fallback: false,
        });
    }

    log::warn!(
        "precision matrix of the latent coefficients is not positive definite; using QR fallback"
    );
    let (q, r) = sigma.qr()?;
    let sigi = symmetrize(&solve_upper_triangular(&r, &q.t())?);
    let mean = sigi.dot(d);
    let (s, u) = sigi.eigh(Side::Lower)?;
    let factor = &u * &s.mapv(|v| v.max(0.0).sqrt());
    Ok(CoefficientPosterior {
        mean,
        factor,
        used_fallback: true,
    })
}

/// Draw the latent coefficient vector from its Gaussian conditional posterior
/// at parameters `x`, reusing the iteration's `T'N⁻¹T` when valid.
pub fn draw_coefficients<M, R>(
    model: &M,
    white: &[usize],
    x: ArrayView1<'_, f64>,
    cache: &mut IterationCache,
    rng: &mut R,
) -> Result<Array1<f64>, GibbsError>
where
    M: NoiseModel + ?Sized,
    R: rand::Rng + ?Sized,
{
    let nvec = model.noise_diagonal(x);
    let phiinv = model.inverse_prior_diag(x);
    if phiinv.is_empty() {
        return Ok(Array1::zeros(0));
    }
    let stats = cache.stats(model, white, x, &nvec);
    let posterior = coefficient_posterior(&stats.tnt, &stats.d, &phiinv)?;
    Ok(posterior.draw(rng))
}
