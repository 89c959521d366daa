use rand::RngExt;
use serde::{Deserialize, Serialize};

/// Semantic role of a hyperparameter within one block-Gibbs iteration.
///
/// Every parameter descriptor carries exactly one role; the sampler resolves
/// roles once at construction and never inspects parameter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterRole {
    WhiteNoise,
    RedNoise,
    CorrelatedNoise,
    GwRho,
}

/// Typed prior with directly accessible numeric support.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundedPrior {
    /// Flat density on `[min, max]`.
    Uniform { min: f64, max: f64 },
    /// Density proportional to `10^x` on `[min, max]` (uniform in `10^x`).
    LinearExp { min: f64, max: f64 },
}

impl BoundedPrior {
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            BoundedPrior::Uniform { min, max } | BoundedPrior::LinearExp { min, max } => {
                (min, max)
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        let (min, max) = self.bounds();
        min.is_finite() && max.is_finite() && min < max
    }

    pub fn contains(&self, x: f64) -> bool {
        let (min, max) = self.bounds();
        x >= min && x <= max
    }

    /// Log density; negative infinity outside the support.
    pub fn log_pdf(&self, x: f64) -> f64 {
        if !self.contains(x) {
            return f64::NEG_INFINITY;
        }
        match *self {
            BoundedPrior::Uniform { min, max } => -(max - min).ln(),
            BoundedPrior::LinearExp { min, max } => {
                let ln10 = std::f64::consts::LN_10;
                ln10.ln() + x * ln10 - (10f64.powf(max) - 10f64.powf(min)).ln()
            }
        }
    }

    pub fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let u = rng.random::<f64>();
        match *self {
            BoundedPrior::Uniform { min, max } => min + u * (max - min),
            BoundedPrior::LinearExp { min, max } => {
                let lo = 10f64.powf(min);
                let hi = 10f64.powf(max);
                (lo + u * (hi - lo)).log10().clamp(min, max)
            }
        }
    }
}

/// One declared hyperparameter, possibly vector-valued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    pub size: usize,
    pub role: ParameterRole,
    pub prior: BoundedPrior,
}

impl ParamDescriptor {
    pub fn scalar(name: impl Into<String>, role: ParameterRole, prior: BoundedPrior) -> Self {
        Self {
            name: name.into(),
            size: 1,
            role,
            prior,
        }
    }

    pub fn vector(
        name: impl Into<String>,
        size: usize,
        role: ParameterRole,
        prior: BoundedPrior,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            role,
            prior,
        }
    }
}

/// Variance-unit bounds `[10^(2·min), 10^(2·max)]` of a `log10` amplitude prior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorBounds {
    pub min: f64,
    pub max: f64,
}

impl PriorBounds {
    pub fn from_log10_amplitude(prior: &BoundedPrior) -> Self {
        let (lo, hi) = prior.bounds();
        Self {
            min: 10f64.powf(2.0 * lo),
            max: 10f64.powf(2.0 * hi),
        }
    }
}

/// What a signal contributes to the noise model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    WhiteNoise,
    RedNoise,
    GravitationalWave,
    /// Epoch-correlated noise expressed through an explicit basis.
    CorrelatedNoiseBasis,
    /// Epoch-correlated noise folded into a dense covariance kernel.
    CorrelatedNoiseKernel,
    Other,
}

/// Sampling strategy for the GW free-spectrum block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RhoSampling {
    #[default]
    Conditional,
    /// Short random-walk sub-chain. Not available.
    Metropolis,
}

/// Sampling strategy for the correlated-noise block. Neither variant is
/// available; a model with correlated-noise parameters is rejected at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorrelatedNoiseSampling {
    Conditional,
    #[default]
    Metropolis,
}

pub fn default_seed() -> u64 {
    42
}

pub fn default_white_tuning_steps() -> usize {
    1000
}

pub fn default_white_burn_in() -> usize {
    100
}

pub fn default_red_tuning_steps() -> usize {
    10_000
}

pub fn default_red_production_steps() -> usize {
    20
}

pub fn default_checkpoint_period() -> usize {
    100
}

pub fn default_rho_grid_points() -> usize {
    1000
}

pub fn default_scam_weight() -> f64 {
    30.0
}

pub fn default_am_weight() -> f64 {
    15.0
}

pub fn default_de_weight() -> f64 {
    50.0
}

pub fn default_initial_covariance_scale() -> f64 {
    0.01
}

pub fn default_covariance_update_period() -> usize {
    1000
}

pub fn default_de_buffer_size() -> usize {
    1000
}

pub fn default_de_buffer_stride() -> usize {
    10
}

/// Jump mixture and adaptation schedule of the full-dimensional engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_scam_weight")]
    pub scam_weight: f64,
    #[serde(default = "default_am_weight")]
    pub am_weight: f64,
    #[serde(default = "default_de_weight")]
    pub de_weight: f64,
    #[serde(default = "default_initial_covariance_scale")]
    pub initial_covariance_scale: f64,
    #[serde(default = "default_covariance_update_period")]
    pub covariance_update_period: usize,
    #[serde(default = "default_de_buffer_size")]
    pub de_buffer_size: usize,
    #[serde(default = "default_de_buffer_stride")]
    pub de_buffer_stride: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scam_weight: default_scam_weight(),
            am_weight: default_am_weight(),
            de_weight: default_de_weight(),
            initial_covariance_scale: default_initial_covariance_scale(),
            covariance_update_period: default_covariance_update_period(),
            de_buffer_size: default_de_buffer_size(),
            de_buffer_stride: default_de_buffer_stride(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        let weights = [self.scam_weight, self.am_weight, self.de_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("engine jump weights must be finite and non-negative".to_string());
        }
        if self.scam_weight + self.am_weight <= 0.0 {
            return Err("engine needs a positive SCAM or AM weight".to_string());
        }
        if !(self.initial_covariance_scale.is_finite() && self.initial_covariance_scale > 0.0) {
            return Err("initial_covariance_scale must be positive".to_string());
        }
        if self.covariance_update_period == 0 {
            return Err("covariance_update_period must be positive".to_string());
        }
        if self.de_buffer_stride == 0 {
            return Err("de_buffer_stride must be positive".to_string());
        }
        if self.de_buffer_size < 2 {
            return Err("de_buffer_size must be at least 2".to_string());
        }
        Ok(())
    }
}

/// Sampler-level configuration for one block-Gibbs run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_white_tuning_steps")]
    pub white_tuning_steps: usize,
    #[serde(default = "default_white_burn_in")]
    pub white_burn_in: usize,
    #[serde(default = "default_red_tuning_steps")]
    pub red_tuning_steps: usize,
    #[serde(default = "default_red_production_steps")]
    pub red_production_steps: usize,
    #[serde(default = "default_checkpoint_period")]
    pub checkpoint_period: usize,
    #[serde(default = "default_rho_grid_points")]
    pub rho_grid_points: usize,
    #[serde(default)]
    pub rho_sampling: RhoSampling,
    #[serde(default)]
    pub correlated_noise_sampling: CorrelatedNoiseSampling,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            white_tuning_steps: default_white_tuning_steps(),
            white_burn_in: default_white_burn_in(),
            red_tuning_steps: default_red_tuning_steps(),
            red_production_steps: default_red_production_steps(),
            checkpoint_period: default_checkpoint_period(),
            rho_grid_points: default_rho_grid_points(),
            rho_sampling: RhoSampling::default(),
            correlated_noise_sampling: CorrelatedNoiseSampling::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.checkpoint_period == 0 {
            return Err("checkpoint_period must be positive".to_string());
        }
        if self.white_tuning_steps < self.white_burn_in + 2 {
            return Err(format!(
                "white_tuning_steps ({}) must exceed white_burn_in ({}) by at least 2",
                self.white_tuning_steps, self.white_burn_in
            ));
        }
        if self.red_tuning_steps == 0 {
            return Err("red_tuning_steps must be positive".to_string());
        }
        if self.red_production_steps == 0 {
            return Err("red_production_steps must be positive".to_string());
        }
        if self.rho_grid_points < 2 {
            return Err("rho_grid_points must be at least 2".to_string());
        }
        self.engine.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn uniform_prior_density_and_support() {
        let prior = BoundedPrior::Uniform { min: -2.0, max: 2.0 };
        assert_abs_diff_eq!(prior.log_pdf(0.3), -(4.0f64).ln(), epsilon = 1e-14);
        assert_eq!(prior.log_pdf(2.5), f64::NEG_INFINITY);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            assert!(prior.contains(prior.sample(&mut rng)));
        }
    }

    #[test]
    fn linear_exp_prior_integrates_to_one() {
        let prior = BoundedPrior::LinearExp { min: -1.0, max: 1.0 };
        let n = 20_000;
        let h = 2.0 / n as f64;
        let integral: f64 = (0..n)
            .map(|i| prior.log_pdf(-1.0 + (i as f64 + 0.5) * h).exp() * h)
            .sum();
        assert_abs_diff_eq!(integral, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn linear_exp_samples_favor_upper_end() {
        let prior = BoundedPrior::LinearExp { min: -3.0, max: 0.0 };
        let mut rng = StdRng::seed_from_u64(11);
        let n = 10_000;
        let upper = (0..n)
            .map(|_| prior.sample(&mut rng))
            .filter(|x| *x > -1.0)
            .count();
        // P(x > -1) = (1 - 0.1) / (1 - 0.001)
        let expected = 0.9 / 0.999;
        assert!((upper as f64 / n as f64 - expected).abs() < 0.02);
    }

    #[test]
    fn prior_bounds_are_variances() {
        let prior = BoundedPrior::Uniform { min: -10.0, max: -5.0 };
        let bounds = PriorBounds::from_log10_amplitude(&prior);
        assert_abs_diff_eq!(bounds.min, 1e-20, epsilon = 1e-34);
        assert_abs_diff_eq!(bounds.max, 1e-10, epsilon = 1e-24);
    }

    #[test]
    fn default_config_is_valid_and_round_trips_partial_json() {
        SamplerConfig::default().validate().expect("defaults valid");
        let cfg: SamplerConfig =
            serde_json::from_str(r#"{"seed": 3, "engine": {"de_weight": 0.0}}"#).expect("json");
        assert_eq!(cfg.seed, 3);
        assert_eq!(cfg.white_tuning_steps, 1000);
        assert_eq!(cfg.engine.scam_weight, 30.0);
        assert_eq!(cfg.engine.de_weight, 0.0);
        assert_eq!(cfg.rho_sampling, RhoSampling::Conditional);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut cfg = SamplerConfig::default();
        cfg.checkpoint_period = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SamplerConfig::default();
        cfg.white_tuning_steps = cfg.white_burn_in;
        assert!(cfg.validate().is_err());

        let mut cfg = SamplerConfig::default();
        cfg.rho_grid_points = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = SamplerConfig::default();
        cfg.engine.de_buffer_stride = 0;
        assert!(cfg.validate().is_err());
    }
}
