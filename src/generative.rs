use crate::gibbs::GibbsError;
use crate::model::NoiseModel;
use ndarray::{Array1, ArrayView1};
use rand_distr::{Distribution, StandardNormal};

/// One synthetic data set drawn from a noise model.
#[derive(Clone, Debug)]
pub struct Simulation {
    pub residuals: Array1<f64>,
    /// Latent coefficients used for the correlated part, `b ~ N(0, φ)`.
    pub coefficients: Array1<f64>,
}

/// Draw `r = T b + n` with `b ~ N(0, diag(φ))` and `n ~ N(0, diag(N))` at
/// parameters `x`.
pub fn simulate_residuals<M, R>(
    model: &M,
    x: ArrayView1<'_, f64>,
    rng: &mut R,
) -> Result<Simulation, GibbsError>
where
    M: NoiseModel + ?Sized,
    R: rand::Rng + ?Sized,
{
    let nvec = model.noise_diagonal(x);
    if let Some(i) = nvec.iter().position(|v| !(v.is_finite() && *v > 0.0)) {
        return Err(GibbsError::InvalidParameters(format!(
            "white-noise variance of TOA {i} is {}",
            nvec[i]
        )));
    }
    let phiinv = model.inverse_prior_diag(x);
    if let Some(j) = phiinv.iter().position(|v| !(v.is_finite() && *v > 0.0)) {
        return Err(GibbsError::InvalidParameters(format!(
            "prior variance of coefficient {j} is not positive and finite"
        )));
    }

    let coefficients: Array1<f64> = phiinv.mapv(|p| {
        let z: f64 = StandardNormal.sample(rng);
        z / p.sqrt()
    });
    let mut residuals: Array1<f64> = nvec.mapv(|n| {
        let z: f64 = StandardNormal.sample(rng);
        z * n.sqrt()
    });
    if !coefficients.is_empty() {
        residuals += &model.basis(x).dot(&coefficients);
    }
    log::debug!(
        "simulated {} residuals for {} from {} latent coefficients",
        residuals.len(),
        model.pulsar_name(),
        coefficients.len()
    );
    Ok(Simulation {
        residuals,
        coefficients,
    })
}
