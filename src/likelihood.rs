use crate::layout::BasisLayout;
use crate::linalg::faer_ndarray::FaerCholesky;
use crate::linalg::utils::KahanSum;
use crate::model::NoiseModel;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use std::ops::Range;

/// Anything that scores a flat parameter vector as `(log-likelihood, log-prior)`.
pub trait LogDensity {
    fn evaluate(&mut self, x: ArrayView1<'_, f64>) -> (f64, f64);
}

impl<F> LogDensity for F
where
    F: FnMut(ArrayView1<'_, f64>) -> (f64, f64),
{
    fn evaluate(&mut self, x: ArrayView1<'_, f64>) -> (f64, f64) {
        self(x)
    }
}

/// `T'N⁻¹T` and `T'N⁻¹r` for one white-noise setting.
#[derive(Debug, Clone)]
pub struct SufficientStats {
    pub tnt: Array2<f64>,
    pub d: Array1<f64>,
    white_key: Array1<f64>,
}

/// Per-iteration cache of the sufficient statistics.
///
/// A fresh cache is built at the start of every outer iteration. Inside the
/// iteration the entry is rebuilt whenever the white-noise sub-vector differs
/// from the one it was computed for.
#[derive(Debug, Default)]
pub struct IterationCache {
    stats: Option<SufficientStats>,
    rebuilds: usize,
}

impl IterationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the statistics were (re)computed in this cache's life.
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    pub fn stats<M: NoiseModel + ?Sized>(
        &mut self,
        model: &M,
        white: &[usize],
        x: ArrayView1<'_, f64>,
        nvec: &Array1<f64>,
    ) -> &SufficientStats {
        let key = Array1::from_iter(white.iter().map(|&i| x[i]));
        if self.stats.as_ref().is_some_and(|s| s.white_key != key) {
            self.stats = None;
        }
        if self.stats.is_none() {
            self.rebuilds += 1;
        }
        self.stats.get_or_insert_with(|| {
            let t = model.basis(x);
            let r = model.residuals();
            let weighted = &*t / &nvec.view().insert_axis(Axis(1));
            let tnt = t.t().dot(&weighted);
            let d = weighted.t().dot(&r);
            log::debug!("rebuilt T'N^-1T cache ({} columns)", tnt.ncols());
            SufficientStats {
                tnt,
                d,
                white_key: key,
            }
        })
    }
}

/// Per-frequency statistic `τ_k = (b_{2k}² + b_{2k+1}²) / 2` over a range of
/// interleaved sine/cosine coefficients.
pub fn pair_tau(b: ArrayView1<'_, f64>, cols: Range<usize>) -> Array1<f64> {
    let n = cols.len() / 2;
    Array1::from_shape_fn(n, |k| {
        let s = b[cols.start + 2 * k];
        let c = b[cols.start + 2 * k + 1];
        0.5 * (s * s + c * c)
    })
}

/// Intrinsic variance aligned to `n` frequencies: the `k`-th sine/cosine pair
/// of `variance`, zero past its end.
pub fn pair_variance(variance: &Array1<f64>, n: usize) -> Array1<f64> {
    Array1::from_shape_fn(n, |k| variance.get(2 * k).copied().unwrap_or(0.0))
}

/// The conditional and marginal log-likelihoods used by the block samplers.
pub struct LikelihoodEvaluator<'a, M: NoiseModel + ?Sized> {
    model: &'a M,
    layout: &'a BasisLayout,
    white: &'a [usize],
}

impl<'a, M: NoiseModel + ?Sized> LikelihoodEvaluator<'a, M> {
    pub fn new(model: &'a M, layout: &'a BasisLayout, white: &'a [usize]) -> Self {
        Self {
            model,
            layout,
            white,
        }
    }

    /// `-½ (Σ log Nᵢ + Σ eᵢ²/Nᵢ)` with `e = r − T b`.
    pub fn white(&self, x: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
        let nvec = self.model.noise_diagonal(x);
        let r = self.model.residuals();
        let t = self.model.basis(x);
        let e = if b.is_empty() {
            r.to_owned()
        } else {
            &r - &t.dot(&b)
        };
        let mut acc = KahanSum::default();
        for (ei, ni) in e.iter().zip(nvec.iter()) {
            acc.add(ni.ln() + ei * ei / ni);
        }
        -0.5 * acc.sum()
    }

    /// `Σ_k [log τ_k − log(irn_k + gw_k) − τ_k / (irn_k + gw_k)]`.
    pub fn red_conditional(&self, x: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
        let signals = self.model.signals();
        let cols = match (self.layout.gw(), self.layout.red()) {
            (Some(gw), _) => gw.col_range.clone(),
            (None, Some(red)) => red.col_range.clone(),
            (None, None) => return 0.0,
        };
        let tau = pair_tau(b, cols);
        let n = tau.len();
        let irn = match self.layout.red() {
            Some(red) => pair_variance(&signals[red.signal].prior_variance(x), n),
            None => Array1::zeros(n),
        };
        let gw = match self.layout.gw() {
            Some(gw) => pair_variance(&signals[gw.signal].prior_variance(x), n),
            None => Array1::zeros(n),
        };
        let mut acc = KahanSum::default();
        for k in 0..n {
            let total = irn[k] + gw[k];
            acc.add(tau[k].ln() - total.ln() - tau[k] / total);
        }
        acc.sum()
    }

    /// Likelihood with the latent coefficients integrated out. Returns
    /// negative infinity when `Σ = T'N⁻¹T + φ⁻¹` is not positive definite.
    pub fn full_marginal(&self, x: ArrayView1<'_, f64>, cache: &mut IterationCache) -> f64 {
        let nvec = self.model.noise_diagonal(x);
        if nvec.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
            return f64::NEG_INFINITY;
        }
        let r = self.model.residuals();
        let mut acc = KahanSum::default();
        for (ri, ni) in r.iter().zip(nvec.iter()) {
            acc.add(ni.ln() + ri * ri / ni);
        }
        let mut loglike = -0.5 * acc.sum();
        if self.layout.width == 0 {
            return loglike;
        }

        let (phiinv, logdet_phi) = self.model.inverse_prior_diag_with_logdet(x);
        let stats = cache.stats(self.model, self.white, x, &nvec);
        let mut sigma = stats.tnt.clone();
        sigma.diag_mut().scaled_add(1.0, &phiinv);
        let chol = match sigma.cholesky(Side::Lower) {
            Ok(chol) => chol,
            Err(_) => return f64::NEG_INFINITY,
        };
        let expval = chol.solve_vec(&stats.d);
        loglike += 0.5 * (stats.d.dot(&expval) - chol.log_det() - logdet_phi);
        if loglike.is_nan() {
            f64::NEG_INFINITY
        } else {
            loglike
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulsar::{FreeSpectrumSpec, ModelSpec, PulsarData, PulsarNoiseModel, WhiteNoiseSpec};
    use crate::types::BoundedPrior;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn model(n: usize, n_freqs: usize) -> PulsarNoiseModel {
        let day = 86_400.0;
        let data = PulsarData {
            name: "P".to_string(),
            toas: (0..n).map(|i| i as f64 * 10.0 * day + (i % 3) as f64 * day).collect(),
            residuals: (0..n).map(|i| 1e-6 * ((i as f64) * 0.7).sin()).collect(),
            toa_errors: vec![1e-6; n],
            backends: Vec::new(),
        };
        let spec = ModelSpec {
            white: Some(WhiteNoiseSpec {
                efac: Some(BoundedPrior::Uniform { min: 0.1, max: 5.0 }),
                log10_tnequad: None,
            }),
            ecorr: None,
            red: None,
            gw: Some(FreeSpectrumSpec {
                n_freqs,
                log10_rho: BoundedPrior::Uniform { min: -9.0, max: -4.0 },
            }),
        };
        PulsarNoiseModel::new(data, &spec).expect("model")
    }

    #[test]
    fn tau_averages_sine_cosine_pairs() {
        let b = array![1.0, 3.0, 2.0, 0.0, 9.0];
        let tau = pair_tau(b.view(), 0..4);
        assert_eq!(tau, array![5.0, 2.0]);
        let aligned = pair_variance(&array![1.0, 1.0, 2.0, 2.0], 3);
        assert_eq!(aligned, array![1.0, 2.0, 0.0]);
    }

    #[test]
    fn white_likelihood_matches_direct_sum() {
        let m = model(20, 2);
        let layout = BasisLayout::from_model(&m);
        let white = [0usize];
        let eval = LikelihoodEvaluator::new(&m, &layout, &white);
        let x = array![1.3, -7.0, -6.5];
        let b = array![1e-7, -2e-7, 3e-7, 0.5e-7];
        let t = m.basis(x.view());
        let e = &m.residuals() - &t.dot(&b);
        let sigma2 = (1.3f64 * 1e-6).powi(2);
        let expected = -0.5 * e.iter().map(|v| sigma2.ln() + v * v / sigma2).sum::<f64>();
        assert_relative_eq!(eval.white(x.view(), b.view()), expected, max_relative = 1e-12);
    }

    #[test]
    fn red_conditional_without_red_uses_gw_variance_only() {
        let m = model(20, 2);
        let layout = BasisLayout::from_model(&m);
        let white = [0usize];
        let eval = LikelihoodEvaluator::new(&m, &layout, &white);
        let x = array![1.0, -7.0, -6.0];
        let b = array![1e-7, 1e-7, 2e-6, 0.0];
        let tau: [f64; 2] = [1e-14, 2e-12];
        let rho: [f64; 2] = [1e-14, 1e-12];
        let expected: f64 = (0..2)
            .map(|k| tau[k].ln() - rho[k].ln() - tau[k] / rho[k])
            .sum();
        assert_relative_eq!(
            eval.red_conditional(x.view(), b.view()),
            expected,
            max_relative = 1e-12
        );
    }

    #[test]
    fn full_marginal_matches_dense_gaussian() {
        let m = model(12, 1);
        let layout = BasisLayout::from_model(&m);
        let white = [0usize];
        let eval = LikelihoodEvaluator::new(&m, &layout, &white);
        let x = array![1.1, -6.0];
        let mut cache = IterationCache::new();
        let got = eval.full_marginal(x.view(), &mut cache);

        // Dense C = N + T φ T'.
        let t = m.basis(x.view()).into_owned();
        let nvec = m.noise_diagonal(x.view());
        let phi = m.inverse_prior_diag(x.view()).mapv(|v| 1.0 / v);
        let mut c = t.dot(&Array2::from_diag(&phi)).dot(&t.t());
        c.diag_mut().scaled_add(1.0, &nvec);
        let chol = c.cholesky(Side::Lower).expect("dense cholesky");
        let r = m.residuals().to_owned();
        let cr = chol.solve_vec(&r);
        let expected = -0.5 * (r.dot(&cr) + chol.log_det());
        assert_relative_eq!(got, expected, max_relative = 1e-8);
    }

    #[test]
    fn cache_rebuilds_only_when_white_parameters_move() {
        let m = model(12, 1);
        let layout = BasisLayout::from_model(&m);
        let white = [0usize];
        let eval = LikelihoodEvaluator::new(&m, &layout, &white);
        let mut cache = IterationCache::new();
        eval.full_marginal(array![1.0, -6.0].view(), &mut cache);
        eval.full_marginal(array![1.0, -5.0].view(), &mut cache);
        assert_eq!(cache.rebuilds(), 1);
        eval.full_marginal(array![1.5, -5.0].view(), &mut cache);
        assert_eq!(cache.rebuilds(), 2);
    }

    #[test]
    fn full_marginal_rejects_invalid_noise_levels() {
        let m = model(12, 1);
        let layout = BasisLayout::from_model(&m);
        let white = [0usize];
        let eval = LikelihoodEvaluator::new(&m, &layout, &white);
        let mut cache = IterationCache::new();
        let got = eval.full_marginal(array![f64::NAN, -6.0].view(), &mut cache);
        assert_eq!(got, f64::NEG_INFINITY);
    }
}
