use crate::autocorr::{AutocorrelationEstimator, thinning_length};
use crate::gibbs::GibbsError;
use crate::likelihood::LogDensity;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::RngExt;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

const STEP_SCALES: [f64; 5] = [0.1, 0.5, 1.0, 3.0, 10.0];
const STEP_WEIGHTS: [f64; 5] = [0.1, 0.15, 0.5, 0.15, 0.1];
const BASE_STEP: f64 = 0.05;

/// Result of the tuning sub-chain of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTuning {
    pub covariance: Array2<f64>,
    pub sigma: Array1<f64>,
    /// Production steps per outer iteration; always at least 1.
    pub thinning: usize,
    pub acceptance_rate: f64,
}

/// Single-parameter Gaussian random-walk Metropolis over one role's indices.
#[derive(Debug, Clone)]
pub struct AdaptiveMetropolisBlock {
    indices: Vec<usize>,
    tuning: Option<BlockTuning>,
}

struct Walker {
    x: Array1<f64>,
    loglike: f64,
    logprior: f64,
}

impl AdaptiveMetropolisBlock {
    pub fn new(indices: Vec<usize>) -> Self {
        Self {
            indices,
            tuning: None,
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn tuning(&self) -> Option<&BlockTuning> {
        self.tuning.as_ref()
    }

    pub fn restore(&mut self, tuning: BlockTuning) {
        self.tuning = Some(tuning);
    }

    pub fn is_tuned(&self) -> bool {
        self.tuning.is_some()
    }

    fn step<T, R>(&self, walker: &mut Walker, target: &mut T, rng: &mut R) -> bool
    where
        T: LogDensity + ?Sized,
        R: rand::Rng + ?Sized,
    {
        let par = self.indices[rng.random_range(0..self.indices.len())];
        let scale = pick_scale(rng.random::<f64>());
        let z: f64 = StandardNormal.sample(rng);
        let mut q = walker.x.clone();
        q[par] += z * BASE_STEP * self.indices.len() as f64 * scale;

        let (loglike, logprior) = target.evaluate(q.view());
        let diff = (loglike + logprior) - (walker.loglike + walker.logprior);
        if diff > rng.random::<f64>().ln() {
            walker.x = q;
            walker.loglike = loglike;
            walker.logprior = logprior;
            true
        } else {
            false
        }
    }

    /// Run `steps` proposals, record the block after each decision, and derive
    /// covariance, per-parameter sigma and thinning from the post-burn-in part.
    pub fn tune<T, R>(
        &mut self,
        x: &Array1<f64>,
        steps: usize,
        burn_in: usize,
        target: &mut T,
        estimator: &dyn AutocorrelationEstimator,
        rng: &mut R,
    ) -> Result<Array1<f64>, GibbsError>
    where
        T: LogDensity + ?Sized,
        R: rand::Rng + ?Sized,
    {
        if self.indices.is_empty() {
            return Ok(x.clone());
        }
        if steps < burn_in + 2 {
            return Err(GibbsError::InvalidConfig(format!(
                "tuning chain of {steps} steps leaves fewer than 2 samples after {burn_in} burn-in"
            )));
        }
        let (loglike, logprior) = target.evaluate(x.view());
        let mut walker = Walker {
            x: x.clone(),
            loglike,
            logprior,
        };
        let mut chain = Array2::<f64>::zeros((steps, self.indices.len()));
        let mut accepted = 0usize;
        for ii in 0..steps {
            if self.step(&mut walker, target, rng) {
                accepted += 1;
            }
            for (j, &idx) in self.indices.iter().enumerate() {
                chain[[ii, j]] = walker.x[idx];
            }
        }

        let retained = chain.slice(ndarray::s![burn_in.., ..]);
        let covariance = sample_covariance(retained);
        let sigma = covariance.diag().mapv(f64::sqrt);
        let taus: Vec<f64> = retained
            .axis_iter(Axis(1))
            .map(|col| estimator.estimate(&col.to_vec()))
            .collect();
        let thinning = thinning_length(&taus);
        let acceptance_rate = accepted as f64 / steps as f64;
        log::info!(
            "tuned {}-parameter block: thinning {}, acceptance {:.3}",
            self.indices.len(),
            thinning,
            acceptance_rate
        );
        self.tuning = Some(BlockTuning {
            covariance,
            sigma,
            thinning,
            acceptance_rate,
        });
        Ok(walker.x)
    }

    /// Run exactly `thinning` proposals from `x` and return the final state.
    pub fn produce<T, R>(
        &self,
        x: &Array1<f64>,
        target: &mut T,
        rng: &mut R,
    ) -> Result<Array1<f64>, GibbsError>
    where
        T: LogDensity + ?Sized,
        R: rand::Rng + ?Sized,
    {
        if self.indices.is_empty() {
            return Ok(x.clone());
        }
        let thinning = match &self.tuning {
            Some(tuning) => tuning.thinning,
            None => {
                return Err(GibbsError::InvalidConfig(
                    "production step requested before the block was tuned".to_string(),
                ));
            }
        };
        let (loglike, logprior) = target.evaluate(x.view());
        let mut walker = Walker {
            x: x.clone(),
            loglike,
            logprior,
        };
        let mut accepted = 0usize;
        for _ in 0..thinning {
            if self.step(&mut walker, target, rng) {
                accepted += 1;
            }
        }
        log::debug!("block production: {accepted}/{thinning} accepted");
        Ok(walker.x)
    }
}

fn pick_scale(u: f64) -> f64 {
    let mut cumulative = 0.0;
    for (scale, weight) in STEP_SCALES.iter().zip(STEP_WEIGHTS.iter()) {
        cumulative += weight;
        if u < cumulative {
            return *scale;
        }
    }
    STEP_SCALES[STEP_SCALES.len() - 1]
}

/// Unbiased sample covariance of the rows of `samples`.
pub fn sample_covariance(samples: ArrayView2<'_, f64>) -> Array2<f64> {
    let n = samples.nrows();
    let p = samples.ncols();
    if n < 2 {
        return Array2::zeros((p, p));
    }
    let mean = samples.sum_axis(Axis(0)) / n as f64;
    let centered = &samples - &mean;
    centered.t().dot(&centered) / (n - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autocorr::SokalWindow;
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayView1, array};
    use rand::{SeedableRng, rngs::StdRng};

    fn gaussian_target(x: ArrayView1<'_, f64>) -> (f64, f64) {
        let ll = -0.5 * (x[0] * x[0] / 0.01 + (x[2] - 1.0).powi(2) / 0.04);
        (ll, 0.0)
    }

    #[test]
    fn scale_mixture_follows_weights() {
        assert_eq!(pick_scale(0.05), 0.1);
        assert_eq!(pick_scale(0.2), 0.5);
        assert_eq!(pick_scale(0.5), 1.0);
        assert_eq!(pick_scale(0.8), 3.0);
        assert_eq!(pick_scale(0.95), 10.0);
    }

    #[test]
    fn tuning_touches_only_block_indices_and_sets_thinning() {
        let mut block = AdaptiveMetropolisBlock::new(vec![0, 2]);
        let x0 = array![0.05, 7.0, 1.0];
        let mut rng = StdRng::seed_from_u64(8);
        let mut target = gaussian_target;
        let x = block
            .tune(&x0, 3000, 100, &mut target, &SokalWindow::default(), &mut rng)
            .expect("tune");
        assert_eq!(x[1], 7.0);
        let tuning = block.tuning().expect("tuned");
        assert!(tuning.thinning >= 1);
        assert_eq!(tuning.covariance.dim(), (2, 2));
        assert!(tuning.acceptance_rate > 0.0 && tuning.acceptance_rate < 1.0);
        assert_abs_diff_eq!(tuning.sigma[0], 0.1, epsilon = 0.03);
        assert_abs_diff_eq!(tuning.sigma[1], 0.2, epsilon = 0.06);
    }

    #[test]
    fn thinning_is_deterministic_for_a_fixed_seed() {
        let run = || {
            let mut block = AdaptiveMetropolisBlock::new(vec![0, 2]);
            let mut rng = StdRng::seed_from_u64(31);
            let mut target = gaussian_target;
            let x = block
                .tune(&array![0.0, 0.0, 0.0], 1000, 100, &mut target, &SokalWindow::default(), &mut rng)
                .expect("tune");
            (x, block.tuning().map(|t| t.thinning))
        };
        let (xa, ta) = run();
        let (xb, tb) = run();
        assert_eq!(xa, xb);
        assert_eq!(ta, tb);
        assert!(ta.is_some_and(|t| t >= 1));
    }

    #[test]
    fn production_requires_tuning_and_runs_thinning_steps() {
        let mut block = AdaptiveMetropolisBlock::new(vec![0]);
        let mut rng = StdRng::seed_from_u64(4);
        let mut calls = 0usize;
        let mut target = |x: ArrayView1<'_, f64>| {
            calls += 1;
            (-0.5 * x[0] * x[0], 0.0)
        };
        assert!(block.produce(&array![0.0], &mut target, &mut rng).is_err());
        block.restore(BlockTuning {
            covariance: array![[1.0]],
            sigma: array![1.0],
            thinning: 7,
            acceptance_rate: 0.5,
        });
        block
            .produce(&array![0.0], &mut target, &mut rng)
            .expect("produce");
        // One evaluation of the starting point plus one per step.
        assert_eq!(calls, 8);
    }

    #[test]
    fn empty_block_is_a_no_op() {
        let mut block = AdaptiveMetropolisBlock::new(Vec::new());
        let mut rng = StdRng::seed_from_u64(1);
        let mut target = |_: ArrayView1<'_, f64>| -> (f64, f64) { panic!("must not evaluate") };
        let x0 = array![1.0, 2.0];
        let x = block
            .tune(&x0, 500, 100, &mut target, &SokalWindow::default(), &mut rng)
            .expect("no-op");
        assert_eq!(x, x0);
        assert!(!block.is_tuned());
    }

    #[test]
    fn covariance_is_unbiased() {
        let samples = array![[1.0, 2.0], [3.0, 6.0], [5.0, 10.0]];
        let cov = sample_covariance(samples.view());
        assert_abs_diff_eq!(cov[[0, 0]], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[0, 1]], 8.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[1, 1]], 16.0, epsilon = 1e-12);
    }
}
