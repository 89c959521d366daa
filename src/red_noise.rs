use crate::engine::{AdaptiveMetropolisEngine, EngineState};
use crate::gibbs::GibbsError;
use crate::likelihood::LogDensity;
use crate::types::EngineConfig;
use ndarray::{Array1, Array2};

/// Red-noise block: a full-dimensional adaptive engine explored once against
/// the full-marginal likelihood, then restricted to the red-noise parameters
/// and driven with the red-conditional likelihood.
#[derive(Debug, Clone)]
pub struct RedNoiseHybridSampler {
    indices: Vec<usize>,
    config: EngineConfig,
    production_steps: usize,
    engine: Option<AdaptiveMetropolisEngine>,
}

impl RedNoiseHybridSampler {
    pub fn new(indices: Vec<usize>, config: EngineConfig, production_steps: usize) -> Self {
        Self {
            indices,
            config,
            production_steps,
            engine: None,
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn is_tuned(&self) -> bool {
        self.engine.is_some()
    }

    /// Adaptive state of the restricted engine, once tuned.
    pub fn engine_state(&self) -> Option<&EngineState> {
        self.engine.as_ref().map(|e| e.state())
    }

    /// Reinstate a tuned engine from saved state.
    pub fn restore(&mut self, dim: usize, state: EngineState) -> Result<(), GibbsError> {
        if state.groups != [self.indices.clone()] {
            return Err(GibbsError::InvalidConfig(
                "saved engine state does not match the red-noise parameters".to_string(),
            ));
        }
        self.engine = Some(AdaptiveMetropolisEngine::from_state(
            dim,
            state,
            self.config.clone(),
        )?);
        Ok(())
    }

    /// Exploratory run over every parameter with `target` (the full marginal
    /// likelihood), one finalizing step, then restriction to the red-noise
    /// group. Returns the state after the finalizing step.
    pub fn tune<T, R>(
        &mut self,
        x: &Array1<f64>,
        steps: usize,
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
        let dim = x.len();
        let initial = Array2::eye(dim) * self.config.initial_covariance_scale;
        let mut engine = AdaptiveMetropolisEngine::new(dim, initial, Vec::new(), self.config.clone())?;

        let (loglike, logprior) = target.evaluate(x.view());
        let (state, loglike, logpost) =
            engine.run(x, loglike, loglike + logprior, steps, target, rng);
        let (state, _, _) = engine.one_step(&state, loglike, logpost, 1.0, target, rng);

        engine.restrict_to_group(&self.indices)?;
        log::info!(
            "red-noise engine tuned over {dim} parameters for {steps} steps, now restricted to {}",
            self.indices.len()
        );
        self.engine = Some(engine);
        Ok(state)
    }

    /// `production_steps` restricted steps against `target` (the red-conditional
    /// likelihood), threading each step's result into the next.
    pub fn produce<T, R>(
        &mut self,
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
        let engine = self.engine.as_mut().ok_or_else(|| {
            GibbsError::InvalidConfig(
                "red-noise production requested before the engine was tuned".to_string(),
            )
        })?;
        let (loglike, logprior) = target.evaluate(x.view());
        let mut current = (x.clone(), loglike, loglike + logprior);
        for _ in 0..self.production_steps {
            current = engine.one_step(&current.0, current.1, current.2, 1.0, target, rng);
        }
        Ok(current.0)
    }
}
