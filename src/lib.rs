#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

pub mod adaptive;
pub mod autocorr;
pub mod chain;
pub mod engine;
pub mod generative;
pub mod gibbs;
pub mod gp;
pub mod layout;
pub mod likelihood;
pub mod linalg;
pub mod model;
pub mod params;
pub mod pulsar;
pub mod red_noise;
pub mod rho;
pub mod types;

pub use adaptive::{AdaptiveMetropolisBlock, BlockTuning};
pub use autocorr::{AutocorrelationEstimator, SokalWindow};
pub use chain::{Chain, ChainError, ResumeState};
pub use engine::{AdaptiveMetropolisEngine, EngineState, JumpKind};
pub use generative::{Simulation, simulate_residuals};
pub use gibbs::{GibbsError, PulsarBlockGibbs, SetupReport};
pub use gp::{CoefficientPosterior, coefficient_posterior, draw_coefficients};
pub use layout::{BasisLayout, SignalColumns};
pub use likelihood::{IterationCache, LikelihoodEvaluator, LogDensity};
pub use model::{NoiseModel, Signal};
pub use params::{ParamValue, ParameterIndex};
pub use pulsar::{
    EcorrRepresentation, EcorrSpec, FreeSpectrumSpec, ModelError, ModelSpec, PowerLawSpec,
    PulsarData, PulsarNoiseModel, WhiteNoiseSpec,
};
pub use red_noise::RedNoiseHybridSampler;
pub use rho::ConditionalRhoSampler;
pub use types::{
    BoundedPrior, CorrelatedNoiseSampling, EngineConfig, ParamDescriptor, ParameterRole,
    PriorBounds, RhoSampling, SamplerConfig, SignalKind,
};
