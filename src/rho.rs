use crate::gibbs::GibbsError;
use crate::types::{BoundedPrior, PriorBounds, RhoSampling};
use ndarray::{Array1, ArrayView1};
use rand::RngExt;
use rand_distr::{Distribution, Gumbel};

/// Exact draw from `p(ρ | τ) ∝ ρ⁻² exp(−τ/ρ)` truncated to `[ρmin, ρmax]`,
/// the GW-rho conditional under a log-uniform prior.
///
/// Inverts `F(ρ) = [exp(−τ/ρ) − exp(−τ/ρmin)] / [exp(−τ/ρmax) − exp(−τ/ρmin)]`.
pub fn draw_rho_analytic<R: rand::Rng + ?Sized>(tau: f64, bounds: PriorBounds, rng: &mut R) -> f64 {
    let u = rng.random::<f64>();
    let upper = -(tau / bounds.max - tau / bounds.min).exp_m1();
    if !(tau > 0.0) || !(upper > 0.0) || !upper.is_finite() {
        // τ → 0 limit: 1/ρ is uniform on [1/ρmax, 1/ρmin].
        let inv = 1.0 / bounds.max + u * (1.0 / bounds.min - 1.0 / bounds.max);
        return (1.0 / inv).clamp(bounds.min, bounds.max);
    }
    let eta = u * upper;
    let rho = tau / (tau / bounds.max - (-eta).ln_1p());
    rho.clamp(bounds.min, bounds.max)
}

/// `n` points uniform in `log10 ρ` over `[ρmin, ρmax]`.
pub fn log_uniform_grid(bounds: PriorBounds, n: usize) -> Array1<f64> {
    let lo = bounds.min.log10();
    let hi = bounds.max.log10();
    if n < 2 {
        return Array1::from_elem(n, bounds.min);
    }
    let step = (hi - lo) / (n - 1) as f64;
    Array1::from_shape_fn(n, |i| 10f64.powf(lo + step * i as f64))
}

/// Un-normalized conditional log density of `ρ` on a grid when intrinsic red
/// variance `irn` shares the frequency: `log τ − log(irn + ρ) − τ/(irn + ρ)`.
pub fn grid_log_density(tau: f64, irn: f64, grid: ArrayView1<'_, f64>) -> Array1<f64> {
    let log_tau = tau.ln();
    grid.mapv(|rho| {
        let total = irn + rho;
        log_tau - total.ln() - tau / total
    })
}

/// Categorical draw proportional to `exp(log_density)` by the Gumbel-max trick.
pub fn gumbel_argmax<R: rand::Rng + ?Sized>(
    log_density: ArrayView1<'_, f64>,
    gumbel: &Gumbel<f64>,
    rng: &mut R,
) -> usize {
    let mut best = 0;
    let mut best_score = f64::NEG_INFINITY;
    for (i, &lp) in log_density.iter().enumerate() {
        let score = lp + gumbel.sample(rng);
        if score > best_score {
            best = i;
            best_score = score;
        }
    }
    best
}

/// Conditional sampler for the GW free-spectrum variances.
#[derive(Debug, Clone)]
pub struct ConditionalRhoSampler {
    /// `log10` amplitude limits written back into the parameter vector.
    limits: Vec<(f64, f64)>,
    bounds: Vec<PriorBounds>,
    grids: Vec<Array1<f64>>,
    gumbel: Gumbel<f64>,
}

impl ConditionalRhoSampler {
    /// One `log10` amplitude prior per frequency. Non-conditional strategies
    /// are rejected.
    pub fn new(
        strategy: RhoSampling,
        priors: &[BoundedPrior],
        grid_points: usize,
    ) -> Result<Self, GibbsError> {
        if strategy != RhoSampling::Conditional {
            return Err(GibbsError::InvalidConfig(
                "only conditional draws are available for the GW free-spectrum block".to_string(),
            ));
        }
        if grid_points < 2 {
            return Err(GibbsError::InvalidConfig(
                "rho grid needs at least two points".to_string(),
            ));
        }
        let limits: Vec<(f64, f64)> = priors.iter().map(|p| p.bounds()).collect();
        let bounds: Vec<PriorBounds> = priors.iter().map(PriorBounds::from_log10_amplitude).collect();
        if let Some(bad) = bounds
            .iter()
            .find(|b| !(b.min > 0.0 && b.max > b.min && b.max.is_finite()))
        {
            return Err(GibbsError::InvalidConfig(format!(
                "invalid rho bounds [{}, {}]",
                bad.min, bad.max
            )));
        }
        let gumbel = Gumbel::new(0.0, 1.0)
            .map_err(|e| GibbsError::InvalidConfig(format!("gumbel distribution: {e}")))?;
        let grids = bounds
            .iter()
            .map(|b| log_uniform_grid(*b, grid_points))
            .collect();
        Ok(Self {
            limits,
            bounds,
            grids,
            gumbel,
        })
    }

    pub fn n_freqs(&self) -> usize {
        self.bounds.len()
    }

    /// New `ρ_k` for every frequency. `irn` is the intrinsic red variance per
    /// frequency, `None` when the model has no red process.
    pub fn draw<R: rand::Rng + ?Sized>(
        &self,
        tau: &Array1<f64>,
        irn: Option<&Array1<f64>>,
        rng: &mut R,
    ) -> Array1<f64> {
        Array1::from_shape_fn(self.bounds.len(), |k| match irn {
            None => draw_rho_analytic(tau[k], self.bounds[k], rng),
            Some(irn) => {
                let grid = &self.grids[k];
                let logpdf = grid_log_density(tau[k].max(f64::MIN_POSITIVE), irn[k], grid.view());
                grid[gumbel_argmax(logpdf.view(), &self.gumbel, rng)]
            }
        })
    }

    /// Draw and write `½ log10 ρ_k`, kept within the prior limits, into the
    /// GW-rho slots of `x`.
    pub fn update<R: rand::Rng + ?Sized>(
        &self,
        x: &mut Array1<f64>,
        rho_indices: &[usize],
        tau: &Array1<f64>,
        irn: Option<&Array1<f64>>,
        rng: &mut R,
    ) {
        let rho = self.draw(tau, irn, rng);
        for ((&slot, value), &(lo, hi)) in rho_indices.iter().zip(rho.iter()).zip(&self.limits) {
            x[slot] = (0.5 * value.log10()).clamp(lo, hi);
        }
    }
}
