use crate::adaptive::{AdaptiveMetropolisBlock, BlockTuning};
use crate::autocorr::{AutocorrelationEstimator, SokalWindow};
use crate::chain::{self, Chain, ChainError, ResumeState};
use crate::engine::EngineState;
use crate::gp::draw_coefficients;
use crate::layout::BasisLayout;
use crate::likelihood::{IterationCache, LikelihoodEvaluator, pair_tau, pair_variance};
use crate::linalg::faer_ndarray::FaerLinalgError;
use crate::model::NoiseModel;
use crate::params::ParameterIndex;
use crate::pulsar::ModelError;
use crate::red_noise::RedNoiseHybridSampler;
use crate::rho::ConditionalRhoSampler;
use crate::types::{ParameterRole, RhoSampling, SamplerConfig, SignalKind};
use ndarray::{Array1, ArrayView1, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

/// Mixes the session's first iteration into the seed.
const SESSION_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Error)]
pub enum GibbsError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("parameter vector has length {found}, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error(transparent)]
    Linalg(#[from] FaerLinalgError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Non-fatal findings from sampler construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupReport {
    warnings: Vec<String>,
}

impl SetupReport {
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Block-Gibbs sampler over one pulsar's noise and GW free-spectrum
/// parameters plus its latent Gaussian-process coefficients.
pub struct PulsarBlockGibbs<M: NoiseModel> {
    model: M,
    config: SamplerConfig,
    index: ParameterIndex,
    layout: BasisLayout,
    white: AdaptiveMetropolisBlock,
    red: RedNoiseHybridSampler,
    rho: Option<ConditionalRhoSampler>,
    estimator: Box<dyn AutocorrelationEstimator>,
    chain: Chain,
    report: SetupReport,
}

impl<M: NoiseModel> PulsarBlockGibbs<M> {
    /// Resolve roles and basis layout once and reject configurations the
    /// sampler cannot run.
    pub fn new(model: M, config: SamplerConfig) -> Result<Self, GibbsError> {
        config.validate().map_err(GibbsError::InvalidConfig)?;
        if config.rho_sampling != RhoSampling::Conditional {
            return Err(GibbsError::InvalidConfig(format!(
                "GW free-spectrum sampling strategy {:?} is not available",
                config.rho_sampling
            )));
        }

        let index = ParameterIndex::new(model.parameters())?;
        if let Some(kernel) = model
            .signals()
            .iter()
            .find(|s| s.kind() == SignalKind::CorrelatedNoiseKernel)
        {
            return Err(GibbsError::UnsupportedModel(format!(
                "correlated noise '{}' is a covariance kernel; only an explicit basis can be sampled",
                kernel.name()
            )));
        }
        let correlated = index.indices(ParameterRole::CorrelatedNoise);
        if !correlated.is_empty() {
            return Err(GibbsError::UnsupportedModel(format!(
                "{} correlated-noise parameters present; the correlated-noise block ({:?}) is not available",
                correlated.len(),
                config.correlated_noise_sampling
            )));
        }

        let layout = BasisLayout::from_model(&model);
        let mut report = SetupReport::default();
        for warning in layout.warnings() {
            log::warn!("{}: {warning}", model.pulsar_name());
            report.warnings.push(warning.clone());
        }

        let gw_rho = index.indices(ParameterRole::GwRho);
        let rho = if gw_rho.is_empty() {
            None
        } else {
            let gw = layout.gw().ok_or_else(|| {
                GibbsError::UnsupportedModel(
                    "GW free-spectrum parameters present without a GW signal basis".to_string(),
                )
            })?;
            if gw.col_range.len() != 2 * gw_rho.len() {
                return Err(GibbsError::UnsupportedModel(format!(
                    "GW basis has {} columns for {} free-spectrum frequencies",
                    gw.col_range.len(),
                    gw_rho.len()
                )));
            }
            Some(ConditionalRhoSampler::new(
                config.rho_sampling,
                index.rho_priors(),
                config.rho_grid_points,
            )?)
        };

        let red_indices = index.indices(ParameterRole::RedNoise).to_vec();
        if !red_indices.is_empty() && layout.red().is_none() {
            return Err(GibbsError::UnsupportedModel(
                "red-noise parameters present without a red-noise signal basis".to_string(),
            ));
        }

        let white = AdaptiveMetropolisBlock::new(index.indices(ParameterRole::WhiteNoise).to_vec());
        let red = RedNoiseHybridSampler::new(
            red_indices,
            config.engine.clone(),
            config.red_production_steps,
        );
        log::info!(
            "{}: {} parameters ({} white, {} red, {} GW rho), {} latent coefficients",
            model.pulsar_name(),
            index.len(),
            white.indices().len(),
            red.indices().len(),
            gw_rho.len(),
            layout.width
        );
        let chain = Chain::new(0, index.len(), layout.width);
        Ok(Self {
            model,
            config,
            index,
            layout,
            white,
            red,
            rho,
            estimator: Box::new(SokalWindow::default()),
            chain,
            report,
        })
    }

    /// Replace the autocorrelation estimator used to set white-block thinning.
    pub fn with_estimator(mut self, estimator: Box<dyn AutocorrelationEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn index(&self) -> &ParameterIndex {
        &self.index
    }

    pub fn layout(&self) -> &BasisLayout {
        &self.layout
    }

    pub fn report(&self) -> &SetupReport {
        &self.report
    }

    /// Chains of the last `sample` call.
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn white_tuning(&self) -> Option<&BlockTuning> {
        self.white.tuning()
    }

    pub fn red_engine_state(&self) -> Option<&EngineState> {
        self.red.engine_state()
    }

    /// Run the chain for `niter` iterations, writing names, periodic
    /// checkpoints and a final checkpoint into `outdir`. With `resume`, rows
    /// already present in `outdir` are kept and sampling continues after them.
    pub fn sample(
        &mut self,
        x0: ArrayView1<'_, f64>,
        outdir: &Path,
        niter: usize,
        resume: bool,
    ) -> Result<(), GibbsError> {
        self.index.check_vector(x0)?;
        let n_params = self.index.len();
        let width = self.layout.width;

        chain::create_output_dir(outdir)?;
        chain::write_names(&outdir.join(chain::PARAM_NAMES_FILE), self.index.param_names())?;
        chain::write_names(
            &outdir.join(chain::COEFFICIENT_NAMES_FILE),
            self.layout.coefficient_names(),
        )?;

        self.chain = Chain::new(niter, n_params, width);
        self.white = AdaptiveMetropolisBlock::new(self.white.indices().to_vec());
        self.red = RedNoiseHybridSampler::new(
            self.red.indices().to_vec(),
            self.config.engine.clone(),
            self.config.red_production_steps,
        );

        let mut x = x0.to_owned();
        let mut b = Array1::<f64>::zeros(width);
        let mut have_coefficients = false;
        let mut start = 0;

        if resume {
            if let Some(reloaded) = chain::reload(outdir, n_params, width)? {
                let rows = reloaded.rows.min(niter);
                self.chain.seed_prefix(
                    reloaded.params.slice(s![..rows, ..]),
                    reloaded.coefficients.slice(s![..rows, ..]),
                );
                if rows >= niter {
                    log::info!("{}: {rows} iterations already on disk", self.model.pulsar_name());
                    return Ok(());
                }
                let saved = reloaded
                    .resume
                    .filter(|state| state.next_iteration == reloaded.rows);
                match saved {
                    Some(state) => {
                        self.restore(&state)?;
                        x = state.params;
                        b = state.coefficients;
                        have_coefficients = true;
                        start = rows;
                    }
                    None if rows > 0 => {
                        x = reloaded.params.row(rows - 1).to_owned();
                        b = reloaded.coefficients.row(rows - 1).to_owned();
                        have_coefficients = true;
                        start = rows;
                    }
                    None => {}
                }
                log::info!(
                    "{}: resuming at iteration {start} of {niter}",
                    self.model.pulsar_name()
                );
            }
        }

        let mut rng = StdRng::seed_from_u64(
            self.config
                .seed
                .wrapping_add((start as u64).wrapping_mul(SESSION_SEED_STRIDE)),
        );
        let clock = Instant::now();
        let white_indices = self.index.indices(ParameterRole::WhiteNoise).to_vec();

        for ii in start..niter {
            self.chain.record(ii, x.view(), b.view());
            let recorded = x.clone();
            let mut cache = IterationCache::new();

            if !have_coefficients {
                b = draw_coefficients(&self.model, &white_indices, x.view(), &mut cache, &mut rng)?;
                have_coefficients = true;
            }

            let model = &self.model;
            let eval = LikelihoodEvaluator::new(model, &self.layout, &white_indices);

            if !self.white.indices().is_empty() {
                let mut target =
                    |q: ArrayView1<'_, f64>| (eval.white(q, b.view()), model.log_prior(q));
                x = if self.white.is_tuned() {
                    self.white.produce(&x, &mut target, &mut rng)?
                } else {
                    self.white.tune(
                        &x,
                        self.config.white_tuning_steps,
                        self.config.white_burn_in,
                        &mut target,
                        self.estimator.as_ref(),
                        &mut rng,
                    )?
                };
            }

            if !self.red.indices().is_empty() {
                if self.red.is_tuned() {
                    let mut target = |q: ArrayView1<'_, f64>| {
                        (eval.red_conditional(q, b.view()), model.log_prior(q))
                    };
                    x = self.red.produce(&x, &mut target, &mut rng)?;
                } else {
                    let mut target = |q: ArrayView1<'_, f64>| {
                        (eval.full_marginal(q, &mut cache), model.log_prior(q))
                    };
                    x = self
                        .red
                        .tune(&x, self.config.red_tuning_steps, &mut target, &mut rng)?;
                }
            }

            if let (Some(rho), Some(gw)) = (&self.rho, self.layout.gw()) {
                let tau = pair_tau(b.view(), gw.col_range.clone());
                let irn = self.layout.red().map(|red| {
                    pair_variance(&model.signals()[red.signal].prior_variance(x.view()), tau.len())
                });
                rho.update(
                    &mut x,
                    self.index.indices(ParameterRole::GwRho),
                    &tau,
                    irn.as_ref(),
                    &mut rng,
                );
            }

            if x != recorded {
                b = draw_coefficients(model, &white_indices, x.view(), &mut cache, &mut rng)?;
            }

            if ii > 0 && ii % self.config.checkpoint_period == 0 {
                self.checkpoint(outdir, ii + 1, &x, &b)?;
                log::info!(
                    "{}: iteration {ii} of {niter}, {:.1}s elapsed",
                    self.model.pulsar_name(),
                    clock.elapsed().as_secs_f64()
                );
            }
        }

        if start < niter {
            self.checkpoint(outdir, niter, &x, &b)?;
            log::info!(
                "{}: finished {niter} iterations in {:.1}s",
                self.model.pulsar_name(),
                clock.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    fn restore(&mut self, state: &ResumeState) -> Result<(), GibbsError> {
        self.index.check_vector(state.params.view())?;
        if state.coefficients.len() != self.layout.width {
            return Err(GibbsError::DimensionMismatch {
                expected: self.layout.width,
                found: state.coefficients.len(),
            });
        }
        if let Some(tuning) = &state.white_tuning {
            let n = self.white.indices().len();
            if tuning.covariance.dim() != (n, n) {
                return Err(GibbsError::InvalidConfig(
                    "saved white-noise tuning does not match the white-noise parameters"
                        .to_string(),
                ));
            }
            self.white.restore(tuning.clone());
        }
        if let Some(engine) = &state.engine {
            self.red.restore(self.index.len(), engine.clone())?;
        }
        Ok(())
    }

    /// Persist rows `0..rows` and the state that starts iteration `rows`.
    fn checkpoint(
        &self,
        outdir: &Path,
        rows: usize,
        x: &Array1<f64>,
        b: &Array1<f64>,
    ) -> Result<(), GibbsError> {
        let state = ResumeState {
            next_iteration: rows,
            params: x.clone(),
            coefficients: b.clone(),
            white_tuning: self.white.tuning().cloned(),
            engine: self.red.engine_state().cloned(),
        };
        chain::write_checkpoint(outdir, &self.chain, rows, &state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Signal;
    use crate::pulsar::{
        EcorrRepresentation, EcorrSpec, FreeSpectrumSpec, ModelSpec, PowerLawSpec, PulsarData,
        PulsarNoiseModel, WhiteNoiseSpec,
    };
    use crate::types::{BoundedPrior, ParamDescriptor};
    use ndarray::{Array2, array};
    use std::borrow::Cow;
    use std::ops::Range;

    fn data(n: usize) -> PulsarData {
        let day = 86_400.0;
        PulsarData {
            name: "J0000+0000".to_string(),
            toas: (0..n).map(|i| i as f64 * 20.0 * day).collect(),
            residuals: (0..n).map(|i| 1e-6 * (i as f64 * 0.37).cos()).collect(),
            toa_errors: vec![1e-6; n],
            backends: Vec::new(),
        }
    }

    fn spec() -> ModelSpec {
        ModelSpec {
            white: Some(WhiteNoiseSpec {
                efac: Some(BoundedPrior::Uniform { min: 0.5, max: 2.0 }),
                log10_tnequad: None,
            }),
            ecorr: None,
            red: Some(PowerLawSpec {
                n_freqs: 2,
                log10_a: BoundedPrior::Uniform { min: -16.0, max: -12.0 },
                gamma: BoundedPrior::Uniform { min: 1.0, max: 6.0 },
            }),
            gw: Some(FreeSpectrumSpec {
                n_freqs: 2,
                log10_rho: BoundedPrior::Uniform { min: -9.0, max: -5.0 },
            }),
        }
    }

    fn quick_config() -> SamplerConfig {
        let mut config = SamplerConfig {
            white_tuning_steps: 200,
            white_burn_in: 50,
            red_tuning_steps: 300,
            red_production_steps: 5,
            checkpoint_period: 4,
            rho_grid_points: 200,
            ..SamplerConfig::default()
        };
        config.engine.covariance_update_period = 100;
        config
    }

    #[test]
    fn kernel_correlated_noise_is_rejected() {
        let mut spec = spec();
        spec.ecorr = Some(EcorrSpec {
            log10_ecorr: BoundedPrior::Uniform { min: -8.0, max: -5.0 },
            dt: 1.0,
            min_toas: 1,
            representation: EcorrRepresentation::Kernel,
        });
        let model = PulsarNoiseModel::new(data(20), &spec).expect("model");
        assert!(matches!(
            PulsarBlockGibbs::new(model, quick_config()),
            Err(GibbsError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn correlated_noise_parameters_are_rejected() {
        let mut spec = spec();
        spec.ecorr = Some(EcorrSpec {
            log10_ecorr: BoundedPrior::Uniform { min: -8.0, max: -5.0 },
            dt: 1.0,
            min_toas: 1,
            representation: EcorrRepresentation::Basis,
        });
        let model = PulsarNoiseModel::new(data(20), &spec).expect("model");
        assert!(matches!(
            PulsarBlockGibbs::new(model, quick_config()),
            Err(GibbsError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn metropolis_rho_strategy_is_rejected() {
        let model = PulsarNoiseModel::new(data(20), &spec()).expect("model");
        let config = SamplerConfig {
            rho_sampling: RhoSampling::Metropolis,
            ..quick_config()
        };
        assert!(matches!(
            PulsarBlockGibbs::new(model, config),
            Err(GibbsError::InvalidConfig(_))
        ));
    }

    struct RhoWithoutBasis {
        residuals: Array1<f64>,
        params: Vec<ParamDescriptor>,
    }

    impl NoiseModel for RhoWithoutBasis {
        fn pulsar_name(&self) -> &str {
            "bare"
        }
        fn parameters(&self) -> &[ParamDescriptor] {
            &self.params
        }
        fn signals(&self) -> Vec<&dyn Signal> {
            Vec::new()
        }
        fn residuals(&self) -> ArrayView1<'_, f64> {
            self.residuals.view()
        }
        fn basis(&self, _x: ArrayView1<'_, f64>) -> Cow<'_, Array2<f64>> {
            Cow::Owned(Array2::zeros((self.residuals.len(), 0)))
        }
        fn noise_diagonal(&self, _x: ArrayView1<'_, f64>) -> Array1<f64> {
            Array1::ones(self.residuals.len())
        }
        fn inverse_prior_diag(&self, _x: ArrayView1<'_, f64>) -> Array1<f64> {
            Array1::zeros(0)
        }
        fn inverse_prior_diag_with_logdet(&self, _x: ArrayView1<'_, f64>) -> (Array1<f64>, f64) {
            (Array1::zeros(0), 0.0)
        }
    }

    #[test]
    fn gw_parameters_need_a_gw_basis() {
        let model = RhoWithoutBasis {
            residuals: array![0.1, -0.2, 0.3],
            params: vec![ParamDescriptor::vector(
                "gw_log10_rho",
                2,
                ParameterRole::GwRho,
                BoundedPrior::Uniform { min: -9.0, max: -5.0 },
            )],
        };
        assert!(matches!(
            PulsarBlockGibbs::new(model, quick_config()),
            Err(GibbsError::UnsupportedModel(_))
        ));
    }

    struct WideSignal;

    impl Signal for WideSignal {
        fn name(&self) -> &str {
            "red"
        }
        fn kind(&self) -> SignalKind {
            SignalKind::RedNoise
        }
        fn basis_columns(&self) -> Option<Range<usize>> {
            Some(0..2)
        }
        fn prior_variance(&self, _x: ArrayView1<'_, f64>) -> Array1<f64> {
            Array1::ones(2)
        }
    }

    struct MisalignedModel {
        residuals: Array1<f64>,
        params: Vec<ParamDescriptor>,
        signal: WideSignal,
    }

    impl NoiseModel for MisalignedModel {
        fn pulsar_name(&self) -> &str {
            "misaligned"
        }
        fn parameters(&self) -> &[ParamDescriptor] {
            &self.params
        }
        fn signals(&self) -> Vec<&dyn Signal> {
            vec![&self.signal as &dyn Signal]
        }
        fn residuals(&self) -> ArrayView1<'_, f64> {
            self.residuals.view()
        }
        fn basis(&self, _x: ArrayView1<'_, f64>) -> Cow<'_, Array2<f64>> {
            Cow::Owned(Array2::from_shape_fn((self.residuals.len(), 3), |(i, j)| {
                ((i + 1) * (j + 1)) as f64 * 0.1
            }))
        }
        fn noise_diagonal(&self, _x: ArrayView1<'_, f64>) -> Array1<f64> {
            Array1::ones(self.residuals.len())
        }
        fn inverse_prior_diag(&self, _x: ArrayView1<'_, f64>) -> Array1<f64> {
            Array1::ones(3)
        }
        fn inverse_prior_diag_with_logdet(&self, _x: ArrayView1<'_, f64>) -> (Array1<f64>, f64) {
            (Array1::ones(3), 0.0)
        }
    }

    #[test]
    fn basis_width_mismatch_is_reported_not_fatal() {
        let model = MisalignedModel {
            residuals: array![0.1, -0.2, 0.3, 0.05],
            params: vec![ParamDescriptor::scalar(
                "red_log10_A",
                ParameterRole::RedNoise,
                BoundedPrior::Uniform { min: -1.0, max: 1.0 },
            )],
            signal: WideSignal,
        };
        let sampler = PulsarBlockGibbs::new(model, quick_config()).expect("warn only");
        assert_eq!(sampler.report().warnings().len(), 1);
        assert_eq!(sampler.layout().coefficient_names()[2], "unassigned_2");
    }

    #[test]
    fn first_row_is_the_initial_state_and_rows_stay_in_support() {
        let model = PulsarNoiseModel::new(data(30), &spec()).expect("model");
        let mut sampler = PulsarBlockGibbs::new(model, quick_config()).expect("sampler");
        let x0 = array![1.0, -14.0, 3.0, -7.0, -7.0];
        let dir = tempfile::tempdir().expect("tempdir");
        sampler.sample(x0.view(), dir.path(), 6, false).expect("sample");

        let chain = sampler.chain();
        assert_eq!(chain.params().row(0), x0);
        assert!(chain.coefficients().row(0).iter().all(|v| *v == 0.0));
        assert!(chain.coefficients().row(1).iter().any(|v| *v != 0.0));
        for row in chain.params().rows() {
            assert!(sampler.model().log_prior(row).is_finite());
        }
        assert!(sampler.white_tuning().is_some_and(|t| t.thinning >= 1));
        assert_eq!(
            sampler.red_engine_state().map(|s| s.groups.clone()),
            Some(vec![vec![1, 2]])
        );
        for name in [
            chain::PARAM_NAMES_FILE,
            chain::COEFFICIENT_NAMES_FILE,
            chain::PARAM_CHAIN_FILE,
            chain::COEFFICIENT_CHAIN_FILE,
            chain::RESUME_FILE,
        ] {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }
    }

    #[test]
    fn wrong_initial_length_is_rejected_before_sampling() {
        let model = PulsarNoiseModel::new(data(30), &spec()).expect("model");
        let mut sampler = PulsarBlockGibbs::new(model, quick_config()).expect("sampler");
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            sampler.sample(array![1.0, 2.0].view(), dir.path(), 3, false),
            Err(GibbsError::DimensionMismatch { expected: 5, found: 2 })
        ));
        assert!(!dir.path().join(chain::PARAM_NAMES_FILE).exists());
    }
}
