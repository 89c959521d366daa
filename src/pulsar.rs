use crate::model::{NoiseModel, Signal};
use crate::types::{BoundedPrior, ParamDescriptor, ParameterRole, SignalKind};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::f64::consts::PI;
use std::ops::Range;
use thiserror::Error;

/// One year in seconds, as used for the power-law reference frequency.
const SECONDS_PER_YEAR: f64 = 3.16e7;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid pulsar data: {0}")]
    InvalidData(String),
    #[error("invalid model specification: {0}")]
    InvalidSpec(String),
    #[error("red noise uses {red} frequencies but the GW free spectrum uses {gw}; a shared basis needs equal counts")]
    FrequencyMismatch { red: usize, gw: usize },
}

/// Timing data of a single pulsar. All times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulsarData {
    pub name: String,
    pub toas: Vec<f64>,
    pub residuals: Vec<f64>,
    pub toa_errors: Vec<f64>,
    /// Backend label per TOA. Empty means a single unnamed backend.
    #[serde(default)]
    pub backends: Vec<String>,
}

impl PulsarData {
    pub fn validate(&self) -> Result<(), ModelError> {
        let n = self.toas.len();
        if n < 2 {
            return Err(ModelError::InvalidData(format!(
                "pulsar '{}' needs at least 2 TOAs, got {n}",
                self.name
            )));
        }
        if self.residuals.len() != n || self.toa_errors.len() != n {
            return Err(ModelError::InvalidData(format!(
                "toas ({n}), residuals ({}) and toa_errors ({}) must have equal length",
                self.residuals.len(),
                self.toa_errors.len()
            )));
        }
        if !self.backends.is_empty() && self.backends.len() != n {
            return Err(ModelError::InvalidData(format!(
                "backends has {} labels for {n} TOAs",
                self.backends.len()
            )));
        }
        if self
            .toas
            .iter()
            .chain(self.residuals.iter())
            .any(|v| !v.is_finite())
        {
            return Err(ModelError::InvalidData(
                "toas and residuals must be finite".to_string(),
            ));
        }
        if self.toa_errors.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(ModelError::InvalidData(
                "toa_errors must be finite and positive".to_string(),
            ));
        }
        if self.span() <= 0.0 {
            return Err(ModelError::InvalidData(
                "TOAs must span a positive time range".to_string(),
            ));
        }
        Ok(())
    }

    pub fn span(&self) -> f64 {
        let lo = self.toas.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = self.toas.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        hi - lo
    }

    /// Distinct backend labels in order of first appearance, with the TOA to
    /// backend assignment.
    fn backend_groups(&self) -> (Vec<String>, Vec<usize>) {
        if self.backends.is_empty() {
            return (vec!["all".to_string()], vec![0; self.toas.len()]);
        }
        let mut labels: Vec<String> = Vec::new();
        let mut assignment = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let idx = match labels.iter().position(|l| l == backend) {
                Some(idx) => idx,
                None => {
                    labels.push(backend.clone());
                    labels.len() - 1
                }
            };
            assignment.push(idx);
        }
        (labels, assignment)
    }
}

pub fn default_efac_prior() -> Option<BoundedPrior> {
    Some(BoundedPrior::Uniform { min: 0.01, max: 10.0 })
}

pub fn default_tnequad_prior() -> Option<BoundedPrior> {
    Some(BoundedPrior::Uniform { min: -8.5, max: -5.0 })
}

pub fn default_log10_a_prior() -> BoundedPrior {
    BoundedPrior::Uniform { min: -20.0, max: -11.0 }
}

pub fn default_gamma_prior() -> BoundedPrior {
    BoundedPrior::Uniform { min: 0.0, max: 7.0 }
}

pub fn default_log10_rho_prior() -> BoundedPrior {
    BoundedPrior::Uniform { min: -10.0, max: -4.0 }
}

pub fn default_ecorr_prior() -> BoundedPrior {
    BoundedPrior::Uniform { min: -8.5, max: -5.0 }
}

pub fn default_ecorr_dt() -> f64 {
    1.0
}

pub fn default_ecorr_min_toas() -> usize {
    2
}

/// Per-backend EFAC and TNEQUAD. A `None` prior removes that parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteNoiseSpec {
    #[serde(default = "default_efac_prior")]
    pub efac: Option<BoundedPrior>,
    #[serde(default = "default_tnequad_prior")]
    pub log10_tnequad: Option<BoundedPrior>,
}

impl Default for WhiteNoiseSpec {
    fn default() -> Self {
        Self {
            efac: default_efac_prior(),
            log10_tnequad: default_tnequad_prior(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerLawSpec {
    pub n_freqs: usize,
    #[serde(default = "default_log10_a_prior")]
    pub log10_a: BoundedPrior,
    #[serde(default = "default_gamma_prior")]
    pub gamma: BoundedPrior,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeSpectrumSpec {
    pub n_freqs: usize,
    #[serde(default = "default_log10_rho_prior")]
    pub log10_rho: BoundedPrior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EcorrRepresentation {
    #[default]
    Basis,
    Kernel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcorrSpec {
    #[serde(default = "default_ecorr_prior")]
    pub log10_ecorr: BoundedPrior,
    /// Epoch window in seconds.
    #[serde(default = "default_ecorr_dt")]
    pub dt: f64,
    #[serde(default = "default_ecorr_min_toas")]
    pub min_toas: usize,
    #[serde(default)]
    pub representation: EcorrRepresentation,
}

/// Which noise components the reference model includes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelSpec {
    #[serde(default)]
    pub white: Option<WhiteNoiseSpec>,
    #[serde(default)]
    pub ecorr: Option<EcorrSpec>,
    #[serde(default)]
    pub red: Option<PowerLawSpec>,
    #[serde(default)]
    pub gw: Option<FreeSpectrumSpec>,
}

#[derive(Debug, Clone)]
enum Component {
    White,
    PowerLaw {
        log10_a: usize,
        gamma: usize,
    },
    FreeSpectrum {
        offset: usize,
        n_freqs: usize,
    },
    Ecorr {
        /// Parameter index of the ECORR amplitude feeding each column.
        column_params: Vec<usize>,
    },
}

/// Concrete signal of the reference model.
#[derive(Debug, Clone)]
pub struct ComponentSignal {
    name: String,
    kind: SignalKind,
    columns: Option<Range<usize>>,
    component: Component,
    /// Fourier frequency of each column, for power-law spectra.
    freqs: Array1<f64>,
    df: f64,
}

impl Signal for ComponentSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SignalKind {
        self.kind
    }

    fn basis_columns(&self) -> Option<Range<usize>> {
        self.columns.clone()
    }

    fn prior_variance(&self, x: ArrayView1<'_, f64>) -> Array1<f64> {
        match &self.component {
            Component::White => Array1::zeros(0),
            Component::PowerLaw { log10_a, gamma } => {
                powerlaw_variance(&self.freqs, self.df, x[*log10_a], x[*gamma])
            }
            Component::FreeSpectrum { offset, n_freqs } => {
                Array1::from_shape_fn(2 * n_freqs, |i| 10f64.powf(2.0 * x[offset + i / 2]))
            }
            Component::Ecorr { column_params } => {
                Array1::from_iter(column_params.iter().map(|p| 10f64.powf(2.0 * x[*p])))
            }
        }
    }
}

/// Power-law variance per Fourier column:
/// `A² / (12π²) · f_yr^(γ−3) · f^(−γ) · Δf`.
pub fn powerlaw_variance(freqs: &Array1<f64>, df: f64, log10_a: f64, gamma: f64) -> Array1<f64> {
    let fyr = 1.0 / SECONDS_PER_YEAR;
    let amp2 = 10f64.powf(2.0 * log10_a);
    freqs.mapv(|f| amp2 / (12.0 * PI * PI) * fyr.powf(gamma - 3.0) * f.powf(-gamma) * df)
}

/// Fourier design matrix with interleaved sine/cosine columns at `k / T`,
/// `k = 1..=n_freqs`, plus the per-column frequencies.
pub fn fourier_basis(toas: &[f64], n_freqs: usize, span: f64) -> (Array2<f64>, Array1<f64>) {
    let t0 = toas.iter().copied().fold(f64::INFINITY, f64::min);
    let freqs = Array1::from_shape_fn(2 * n_freqs, |i| (i / 2 + 1) as f64 / span);
    let basis = Array2::from_shape_fn((toas.len(), 2 * n_freqs), |(row, col)| {
        let phase = 2.0 * PI * freqs[col] * (toas[row] - t0);
        if col % 2 == 0 { phase.sin() } else { phase.cos() }
    });
    (basis, freqs)
}

/// Group TOAs of each backend into epochs: a TOA joins the current epoch when
/// it lies within `dt` of the epoch's first TOA. Epochs with fewer than
/// `min_toas` TOAs are dropped. Returns `(backend, TOA indices)` per epoch.
pub fn quantize_epochs(
    toas: &[f64],
    assignment: &[usize],
    n_backends: usize,
    dt: f64,
    min_toas: usize,
) -> Vec<(usize, Vec<usize>)> {
    let mut epochs = Vec::new();
    for backend in 0..n_backends {
        let mut idx: Vec<usize> = (0..toas.len())
            .filter(|i| assignment[*i] == backend)
            .collect();
        idx.sort_by(|a, b| toas[*a].total_cmp(&toas[*b]));
        let mut current: Vec<usize> = Vec::new();
        for i in idx {
            let starts_new = current.first().is_some_and(|first| toas[i] - toas[*first] >= dt);
            if starts_new {
                if current.len() >= min_toas {
                    epochs.push((backend, std::mem::take(&mut current)));
                } else {
                    current.clear();
                }
            }
            current.push(i);
        }
        if current.len() >= min_toas {
            epochs.push((backend, current));
        }
    }
    epochs
}

/// Reference single-pulsar model: per-backend white noise, optional ECORR,
/// a power-law red process and a GW free spectrum on a shared Fourier basis.
#[derive(Debug, Clone)]
pub struct PulsarNoiseModel {
    name: String,
    residuals: Array1<f64>,
    toa_errors: Array1<f64>,
    backend_of_toa: Vec<usize>,
    /// `(efac, log10_tnequad)` parameter indices per backend.
    white_params: Vec<(Option<usize>, Option<usize>)>,
    parameters: Vec<ParamDescriptor>,
    signals: Vec<ComponentSignal>,
    basis: Array2<f64>,
    freqs: Array1<f64>,
}

impl PulsarNoiseModel {
    pub fn new(data: PulsarData, spec: &ModelSpec) -> Result<Self, ModelError> {
        data.validate()?;
        let psr = data.name.clone();
        let (backends, assignment) = data.backend_groups();
        let span = data.span();

        let n_freqs = match (&spec.red, &spec.gw) {
            (Some(red), Some(gw)) if red.n_freqs != gw.n_freqs => {
                return Err(ModelError::FrequencyMismatch {
                    red: red.n_freqs,
                    gw: gw.n_freqs,
                });
            }
            (Some(red), _) => red.n_freqs,
            (None, Some(gw)) => gw.n_freqs,
            (None, None) => 0,
        };
        if (spec.red.is_some() || spec.gw.is_some()) && n_freqs == 0 {
            return Err(ModelError::InvalidSpec(
                "Fourier processes need at least one frequency".to_string(),
            ));
        }

        let mut parameters = Vec::new();
        let mut signals = Vec::new();

        let mut white_params = vec![(None, None); backends.len()];
        if let Some(white) = &spec.white {
            for (b, backend) in backends.iter().enumerate() {
                if let Some(prior) = white.efac {
                    check_prior(&prior, "efac")?;
                    white_params[b].0 = Some(declare(
                        ParamDescriptor::scalar(
                            format!("{psr}_{backend}_efac"),
                            ParameterRole::WhiteNoise,
                            prior,
                        ),
                        &mut parameters,
                    ));
                }
                if let Some(prior) = white.log10_tnequad {
                    check_prior(&prior, "log10_tnequad")?;
                    white_params[b].1 = Some(declare(
                        ParamDescriptor::scalar(
                            format!("{psr}_{backend}_log10_tnequad"),
                            ParameterRole::WhiteNoise,
                            prior,
                        ),
                        &mut parameters,
                    ));
                }
            }
            signals.push(ComponentSignal {
                name: format!("{psr}_measurement_noise"),
                kind: SignalKind::WhiteNoise,
                columns: None,
                component: Component::White,
                freqs: Array1::zeros(0),
                df: 0.0,
            });
        }

        let (fourier, freqs) = fourier_basis(&data.toas, n_freqs, span);
        let df = 1.0 / span;
        let fourier_cols = 0..2 * n_freqs;

        let mut ecorr_columns: Vec<Vec<usize>> = Vec::new();
        if let Some(ecorr) = &spec.ecorr {
            check_prior(&ecorr.log10_ecorr, "log10_ecorr")?;
            if !(ecorr.dt.is_finite() && ecorr.dt > 0.0) {
                return Err(ModelError::InvalidSpec(
                    "ECORR epoch window must be positive".to_string(),
                ));
            }
            let mut backend_param = Vec::with_capacity(backends.len());
            for backend in &backends {
                backend_param.push(declare(
                    ParamDescriptor::scalar(
                        format!("{psr}_{backend}_log10_ecorr"),
                        ParameterRole::CorrelatedNoise,
                        ecorr.log10_ecorr,
                    ),
                    &mut parameters,
                ));
            }
            match ecorr.representation {
                EcorrRepresentation::Basis => {
                    let epochs = quantize_epochs(
                        &data.toas,
                        &assignment,
                        backends.len(),
                        ecorr.dt,
                        ecorr.min_toas.max(1),
                    );
                    let column_params = epochs.iter().map(|(b, _)| backend_param[*b]).collect();
                    ecorr_columns = epochs.into_iter().map(|(_, toas)| toas).collect();
                    let start = fourier_cols.end;
                    signals.push(ComponentSignal {
                        name: format!("{psr}_basis_ecorr"),
                        kind: SignalKind::CorrelatedNoiseBasis,
                        columns: Some(start..start + ecorr_columns.len()),
                        component: Component::Ecorr { column_params },
                        freqs: Array1::zeros(0),
                        df: 0.0,
                    });
                }
                EcorrRepresentation::Kernel => {
                    signals.push(ComponentSignal {
                        name: format!("{psr}_kernel_ecorr"),
                        kind: SignalKind::CorrelatedNoiseKernel,
                        columns: None,
                        component: Component::Ecorr {
                            column_params: Vec::new(),
                        },
                        freqs: Array1::zeros(0),
                        df: 0.0,
                    });
                }
            }
        }

        if let Some(red) = &spec.red {
            check_prior(&red.log10_a, "red noise log10_A")?;
            check_prior(&red.gamma, "red noise gamma")?;
            let log10_a = declare(
                ParamDescriptor::scalar(
                    format!("{psr}_red_noise_log10_A"),
                    ParameterRole::RedNoise,
                    red.log10_a,
                ),
                &mut parameters,
            );
            let gamma = declare(
                ParamDescriptor::scalar(
                    format!("{psr}_red_noise_gamma"),
                    ParameterRole::RedNoise,
                    red.gamma,
                ),
                &mut parameters,
            );
            signals.push(ComponentSignal {
                name: format!("{psr}_red_noise"),
                kind: SignalKind::RedNoise,
                columns: Some(fourier_cols.clone()),
                component: Component::PowerLaw { log10_a, gamma },
                freqs: freqs.clone(),
                df,
            });
        }

        if let Some(gw) = &spec.gw {
            check_prior(&gw.log10_rho, "gw log10_rho")?;
            let offset = declare(
                ParamDescriptor::vector(
                    "gw_log10_rho",
                    gw.n_freqs,
                    ParameterRole::GwRho,
                    gw.log10_rho,
                ),
                &mut parameters,
            );
            signals.push(ComponentSignal {
                name: "gw".to_string(),
                kind: SignalKind::GravitationalWave,
                columns: Some(fourier_cols.clone()),
                component: Component::FreeSpectrum {
                    offset,
                    n_freqs: gw.n_freqs,
                },
                freqs: freqs.clone(),
                df,
            });
        }

        let n_toas = data.toas.len();
        let width = fourier_cols.end + ecorr_columns.len();
        let mut basis = Array2::<f64>::zeros((n_toas, width));
        basis
            .slice_mut(ndarray::s![.., ..fourier_cols.end])
            .assign(&fourier);
        for (k, toas) in ecorr_columns.iter().enumerate() {
            for &i in toas {
                basis[[i, fourier_cols.end + k]] = 1.0;
            }
        }

        log::debug!(
            "built noise model for {psr}: {} parameters, {} basis columns",
            parameters.len(),
            width
        );

        Ok(Self {
            name: psr,
            residuals: Array1::from(data.residuals),
            toa_errors: Array1::from(data.toa_errors),
            backend_of_toa: assignment,
            white_params,
            parameters,
            signals,
            basis,
            freqs,
        })
    }

    /// Fourier frequency of each sine/cosine column.
    pub fn frequencies(&self) -> &Array1<f64> {
        &self.freqs
    }
}

/// Append a descriptor and return the flat index of its first element.
fn declare(descriptor: ParamDescriptor, parameters: &mut Vec<ParamDescriptor>) -> usize {
    let idx = parameters.iter().map(|p| p.size).sum();
    parameters.push(descriptor);
    idx
}

fn check_prior(prior: &BoundedPrior, what: &str) -> Result<(), ModelError> {
    if prior.is_valid() {
        Ok(())
    } else {
        let (min, max) = prior.bounds();
        Err(ModelError::InvalidSpec(format!(
            "{what} prior needs finite min < max, got [{min}, {max}]"
        )))
    }
}

impl NoiseModel for PulsarNoiseModel {
    fn pulsar_name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> &[ParamDescriptor] {
        &self.parameters
    }

    fn signals(&self) -> Vec<&dyn Signal> {
        self.signals.iter().map(|s| s as &dyn Signal).collect()
    }

    fn residuals(&self) -> ArrayView1<'_, f64> {
        self.residuals.view()
    }

    fn basis(&self, _x: ArrayView1<'_, f64>) -> Cow<'_, Array2<f64>> {
        Cow::Borrowed(&self.basis)
    }

    fn noise_diagonal(&self, x: ArrayView1<'_, f64>) -> Array1<f64> {
        Array1::from_shape_fn(self.toa_errors.len(), |i| {
            let (efac, equad) = self.white_params[self.backend_of_toa[i]];
            let efac = efac.map_or(1.0, |p| x[p]);
            let equad2 = equad.map_or(0.0, |p| 10f64.powf(2.0 * x[p]));
            efac * efac * self.toa_errors[i] * self.toa_errors[i] + equad2
        })
    }

    fn inverse_prior_diag(&self, x: ArrayView1<'_, f64>) -> Array1<f64> {
        self.inverse_prior_diag_with_logdet(x).0
    }

    fn inverse_prior_diag_with_logdet(&self, x: ArrayView1<'_, f64>) -> (Array1<f64>, f64) {
        let mut phi = Array1::<f64>::zeros(self.basis.ncols());
        for signal in &self.signals {
            if let Some(cols) = signal.basis_columns() {
                let var = signal.prior_variance(x);
                phi.slice_mut(ndarray::s![cols]).scaled_add(1.0, &var);
            }
        }
        let logdet = phi.iter().map(|v| v.ln()).sum();
        (phi.mapv(|v| 1.0 / v), logdet)
    }
}
