/// Integrated autocorrelation time of a scalar chain.
pub trait AutocorrelationEstimator {
    fn estimate(&self, series: &[f64]) -> f64;
}

/// Sokal's self-consistent window: `τ = 1 + 2 Σ_{k=1}^{M} ρ_k`, with the
/// window `M` grown until `M ≥ c·τ`.
#[derive(Debug, Clone, Copy)]
pub struct SokalWindow {
    pub c: f64,
}

impl Default for SokalWindow {
    fn default() -> Self {
        Self { c: 5.0 }
    }
}

impl AutocorrelationEstimator for SokalWindow {
    fn estimate(&self, series: &[f64]) -> f64 {
        let n = series.len();
        if n < 2 {
            return 1.0;
        }
        let mean = series.iter().sum::<f64>() / n as f64;
        let variance = series.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        if !(variance.is_finite() && variance > 0.0) {
            return 1.0;
        }

        let mut tau = 1.0;
        for lag in 1..n {
            let mut covariance = 0.0;
            for i in 0..(n - lag) {
                covariance += (series[i] - mean) * (series[i + lag] - mean);
            }
            covariance /= n as f64;
            tau += 2.0 * covariance / variance;
            if lag as f64 >= self.c * tau {
                break;
            }
        }
        tau
    }
}

/// Production thinning from per-parameter autocorrelation times:
/// `max(1, round(max τ))`, with non-finite times counting as 1.
pub fn thinning_length(taus: &[f64]) -> usize {
    let max_tau = taus
        .iter()
        .map(|t| if t.is_finite() { *t } else { 1.0 })
        .fold(1.0, f64::max);
    (max_tau.round() as usize).max(1)
}
