use crate::gibbs::GibbsError;
use crate::likelihood::LogDensity;
use crate::linalg::faer_ndarray::FaerEigh;
use crate::types::EngineConfig;
use faer::Side;
use ndarray::{Array1, Array2};
use rand::RngExt;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Proposal families mixed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JumpKind {
    /// Single-component adaptive Metropolis along one eigen-direction.
    Scam,
    /// Full-group adaptive Metropolis.
    Am,
    /// Differential evolution from buffered states.
    De,
}

impl JumpKind {
    fn slot(self) -> usize {
        match self {
            JumpKind::Scam => 0,
            JumpKind::Am => 1,
            JumpKind::De => 2,
        }
    }
}

/// Adaptive state of the engine. Covariance, running moments and DE buffer
/// are expressed over the `tracked` parameter positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub tracked: Vec<usize>,
    pub covariance: Array2<f64>,
    pub groups: Vec<Vec<usize>>,
    pub de_buffer: Vec<Array1<f64>>,
    pub running_mean: Array1<f64>,
    pub running_m2: Array2<f64>,
    pub samples_seen: usize,
}

#[derive(Debug, Clone)]
struct GroupJump {
    indices: Vec<usize>,
    /// Positions of `indices` within `EngineState::tracked`.
    positions: Vec<usize>,
    values: Array1<f64>,
    vectors: Array2<f64>,
}

/// Full-dimensional adaptive Metropolis sampler with SCAM, AM and DE jumps.
#[derive(Debug, Clone)]
pub struct AdaptiveMetropolisEngine {
    dim: usize,
    config: EngineConfig,
    state: EngineState,
    jumps: Vec<GroupJump>,
    proposed: [usize; 3],
    accepted: [usize; 3],
}

impl AdaptiveMetropolisEngine {
    /// Engine over `dim` parameters. An empty `groups` means one group holding
    /// every parameter.
    pub fn new(
        dim: usize,
        initial_covariance: Array2<f64>,
        groups: Vec<Vec<usize>>,
        config: EngineConfig,
    ) -> Result<Self, GibbsError> {
        if initial_covariance.dim() != (dim, dim) {
            return Err(GibbsError::InvalidConfig(format!(
                "initial covariance is {:?}, expected {dim}x{dim}",
                initial_covariance.dim()
            )));
        }
        let groups = if groups.is_empty() {
            vec![(0..dim).collect()]
        } else {
            groups
        };
        let state = EngineState {
            tracked: (0..dim).collect(),
            covariance: initial_covariance,
            groups,
            de_buffer: Vec::new(),
            running_mean: Array1::zeros(dim),
            running_m2: Array2::zeros((dim, dim)),
            samples_seen: 0,
        };
        Self::from_state(dim, state, config)
    }

    /// Rebuild an engine from a saved state, recomputing group decompositions.
    pub fn from_state(
        dim: usize,
        state: EngineState,
        config: EngineConfig,
    ) -> Result<Self, GibbsError> {
        config.validate().map_err(GibbsError::InvalidConfig)?;
        let n = state.tracked.len();
        if state.covariance.dim() != (n, n)
            || state.running_mean.len() != n
            || state.running_m2.dim() != (n, n)
            || state.de_buffer.iter().any(|v| v.len() != n)
        {
            return Err(GibbsError::InvalidConfig(
                "engine state dimensions are inconsistent".to_string(),
            ));
        }
        if state.tracked.iter().any(|&i| i >= dim) {
            return Err(GibbsError::InvalidConfig(format!(
                "engine state tracks a parameter outside dimension {dim}"
            )));
        }
        let jumps = decompose(&state)?;
        Ok(Self {
            dim,
            config,
            state,
            jumps,
            proposed: [0; 3],
            accepted: [0; 3],
        })
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Acceptance fraction per jump kind, `None` for kinds never proposed.
    pub fn acceptance_rate(&self, kind: JumpKind) -> Option<f64> {
        let slot = kind.slot();
        (self.proposed[slot] > 0).then(|| self.accepted[slot] as f64 / self.proposed[slot] as f64)
    }

    /// Make `indices` the only proposal group, keep the covariance, running
    /// moments and DE buffer for those parameters only, and recompute the
    /// jump decomposition.
    pub fn restrict_to_group(&mut self, indices: &[usize]) -> Result<(), GibbsError> {
        if indices.is_empty() {
            return Err(GibbsError::InvalidConfig(
                "cannot restrict the engine to an empty group".to_string(),
            ));
        }
        let positions = positions_of(&self.state.tracked, indices)?;
        let pick = |m: &Array2<f64>| {
            Array2::from_shape_fn((positions.len(), positions.len()), |(a, b)| {
                m[[positions[a], positions[b]]]
            })
        };
        let covariance = pick(&self.state.covariance);
        let running_m2 = pick(&self.state.running_m2);
        let running_mean = Array1::from_iter(positions.iter().map(|&p| self.state.running_mean[p]));
        let de_buffer = self
            .state
            .de_buffer
            .iter()
            .map(|v| Array1::from_iter(positions.iter().map(|&p| v[p])))
            .collect();
        let state = EngineState {
            tracked: indices.to_vec(),
            covariance,
            groups: vec![indices.to_vec()],
            de_buffer,
            running_mean,
            running_m2,
            samples_seen: self.state.samples_seen,
        };
        self.jumps = decompose(&state)?;
        self.state = state;
        self.proposed = [0; 3];
        self.accepted = [0; 3];
        Ok(())
    }

    fn choose_jump<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> JumpKind {
        let de = if self.state.de_buffer.len() >= 2 {
            self.config.de_weight
        } else {
            0.0
        };
        let total = self.config.scam_weight + self.config.am_weight + de;
        let u = rng.random::<f64>() * total;
        if u < self.config.scam_weight {
            JumpKind::Scam
        } else if u < self.config.scam_weight + self.config.am_weight {
            JumpKind::Am
        } else {
            JumpKind::De
        }
    }

    fn propose<R: rand::Rng + ?Sized>(
        &self,
        kind: JumpKind,
        x: &Array1<f64>,
        temperature: f64,
        rng: &mut R,
    ) -> Array1<f64> {
        let group = &self.jumps[rng.random_range(0..self.jumps.len())];
        let ndim = group.indices.len();
        let mut q = x.clone();
        match kind {
            JumpKind::Scam => {
                let u = rng.random::<f64>();
                let scale = if u > 0.97 {
                    10.0
                } else if u > 0.9 {
                    0.2
                } else {
                    1.0
                };
                let cd = 2.4 * temperature.sqrt() / 2f64.sqrt() * scale;
                let j = rng.random_range(0..ndim);
                let z: f64 = StandardNormal.sample(rng);
                let step = z * cd * group.values[j].sqrt();
                for (k, &idx) in group.indices.iter().enumerate() {
                    q[idx] += step * group.vectors[[k, j]];
                }
            }
            JumpKind::Am => {
                let cd = 2.38 / (2.0 * ndim as f64).sqrt() * temperature.sqrt();
                let y = Array1::from_shape_fn(ndim, |j| {
                    let z: f64 = StandardNormal.sample(rng);
                    z * cd * group.values[j].sqrt()
                });
                let delta = group.vectors.dot(&y);
                for (k, &idx) in group.indices.iter().enumerate() {
                    q[idx] += delta[k];
                }
            }
            JumpKind::De => {
                let n = self.state.de_buffer.len();
                let mm = rng.random_range(0..n);
                let mut nn = rng.random_range(0..n - 1);
                if nn >= mm {
                    nn += 1;
                }
                let scale = if rng.random::<f64>() > 0.5 {
                    1.0
                } else {
                    2.38 / (2.0 * ndim as f64).sqrt() * temperature.sqrt()
                };
                let a = &self.state.de_buffer[mm];
                let b = &self.state.de_buffer[nn];
                for (&idx, &pos) in group.indices.iter().zip(group.positions.iter()) {
                    q[idx] += scale * (a[pos] - b[pos]);
                }
            }
        }
        q
    }

    /// One tempered Metropolis step. `logpost` is `loglike / T + logprior` at
    /// `x`; the returned triple describes the state after the decision.
    pub fn one_step<T, R>(
        &mut self,
        x: &Array1<f64>,
        loglike: f64,
        logpost: f64,
        temperature: f64,
        target: &mut T,
        rng: &mut R,
    ) -> (Array1<f64>, f64, f64)
    where
        T: LogDensity + ?Sized,
        R: rand::Rng + ?Sized,
    {
        let kind = self.choose_jump(rng);
        let q = self.propose(kind, x, temperature, rng);
        self.proposed[kind.slot()] += 1;
        let (ll1, lp1) = target.evaluate(q.view());
        let logpost1 = ll1 / temperature + lp1;
        if logpost1 - logpost > rng.random::<f64>().ln() {
            self.accepted[kind.slot()] += 1;
            (q, ll1, logpost1)
        } else {
            (x.clone(), loglike, logpost)
        }
    }

    /// `steps` adaptive steps at unit temperature: running moments are updated
    /// every step, the DE buffer every `de_buffer_stride` steps and the
    /// covariance with its decompositions every `covariance_update_period`.
    pub fn run<T, R>(
        &mut self,
        x: &Array1<f64>,
        loglike: f64,
        logpost: f64,
        steps: usize,
        target: &mut T,
        rng: &mut R,
    ) -> (Array1<f64>, f64, f64)
    where
        T: LogDensity + ?Sized,
        R: rand::Rng + ?Sized,
    {
        let mut current = (x.clone(), loglike, logpost);
        for step in 1..=steps {
            current = self.one_step(&current.0, current.1, current.2, 1.0, target, rng);
            self.observe(&current.0);
            if step % self.config.de_buffer_stride == 0 {
                let tracked = self.tracked_values(&current.0);
                if self.state.de_buffer.len() >= self.config.de_buffer_size {
                    self.state.de_buffer.remove(0);
                }
                self.state.de_buffer.push(tracked);
            }
            if step % self.config.covariance_update_period == 0 {
                self.refresh_covariance();
            }
        }
        log::info!(
            "engine run of {steps} steps: acceptance scam={:?} am={:?} de={:?}",
            self.acceptance_rate(JumpKind::Scam),
            self.acceptance_rate(JumpKind::Am),
            self.acceptance_rate(JumpKind::De)
        );
        current
    }

    fn tracked_values(&self, x: &Array1<f64>) -> Array1<f64> {
        Array1::from_iter(self.state.tracked.iter().map(|&i| x[i]))
    }

    fn observe(&mut self, x: &Array1<f64>) {
        let values = self.tracked_values(x);
        self.state.samples_seen += 1;
        let n = self.state.samples_seen as f64;
        let delta = &values - &self.state.running_mean;
        self.state.running_mean.scaled_add(1.0 / n, &delta);
        let delta2 = &values - &self.state.running_mean;
        let p = delta.len();
        for a in 0..p {
            for b in 0..p {
                self.state.running_m2[[a, b]] += delta[a] * delta2[b];
            }
        }
    }

    fn refresh_covariance(&mut self) {
        if self.state.samples_seen < 2 {
            return;
        }
        let covariance = &self.state.running_m2 / (self.state.samples_seen - 1) as f64;
        let previous = std::mem::replace(&mut self.state.covariance, covariance);
        match decompose(&self.state) {
            Ok(jumps) => self.jumps = jumps,
            Err(err) => {
                log::warn!("keeping previous engine covariance: {err}");
                self.state.covariance = previous;
            }
        }
    }
}

fn positions_of(tracked: &[usize], indices: &[usize]) -> Result<Vec<usize>, GibbsError> {
    indices
        .iter()
        .map(|idx| {
            tracked.iter().position(|t| t == idx).ok_or_else(|| {
                GibbsError::InvalidConfig(format!(
                    "parameter {idx} is not tracked by the engine covariance"
                ))
            })
        })
        .collect()
}

fn decompose(state: &EngineState) -> Result<Vec<GroupJump>, GibbsError> {
    state
        .groups
        .iter()
        .map(|indices| {
            if indices.is_empty() {
                return Err(GibbsError::InvalidConfig(
                    "engine proposal groups must be non-empty".to_string(),
                ));
            }
            let positions = positions_of(&state.tracked, indices)?;
            let sub = Array2::from_shape_fn((positions.len(), positions.len()), |(a, b)| {
                state.covariance[[positions[a], positions[b]]]
            });
            let (values, vectors) = sub.eigh(Side::Lower)?;
            Ok(GroupJump {
                indices: indices.clone(),
                positions,
                values: values.mapv(|v| v.max(0.0)),
                vectors,
            })
        })
        .collect()
}
