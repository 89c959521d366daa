use crate::gibbs::GibbsError;
use crate::types::{BoundedPrior, ParamDescriptor, ParameterRole, PriorBounds};
use ndarray::{Array1, ArrayView1};
use std::collections::{BTreeMap, HashSet};

/// Named view of one declared parameter inside a flat vector.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Scalar(f64),
    Vector(Array1<f64>),
}

/// Resolves flat parameter-vector positions into roles, once, from the
/// declared descriptors.
#[derive(Debug, Clone)]
pub struct ParameterIndex {
    descriptors: Vec<ParamDescriptor>,
    offsets: Vec<usize>,
    names: Vec<String>,
    roles: Vec<ParameterRole>,
    white: Vec<usize>,
    red: Vec<usize>,
    correlated: Vec<usize>,
    gw_rho: Vec<usize>,
    rho_priors: Vec<BoundedPrior>,
    rho_bounds: Vec<PriorBounds>,
}

impl ParameterIndex {
    pub fn new(descriptors: &[ParamDescriptor]) -> Result<Self, GibbsError> {
        if descriptors.is_empty() {
            return Err(GibbsError::InvalidParameters(
                "the noise model declares no parameters".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        let mut offsets = Vec::with_capacity(descriptors.len());
        let mut names = Vec::new();
        let mut roles = Vec::new();
        let mut rho_priors = Vec::new();
        let mut rho_bounds = Vec::new();
        for param in descriptors {
            if param.size == 0 {
                return Err(GibbsError::InvalidParameters(format!(
                    "parameter '{}' has size 0",
                    param.name
                )));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(GibbsError::InvalidParameters(format!(
                    "parameter '{}' is declared twice",
                    param.name
                )));
            }
            if !param.prior.is_valid() {
                let (min, max) = param.prior.bounds();
                return Err(GibbsError::InvalidParameters(format!(
                    "parameter '{}' has an invalid prior range [{min}, {max}]",
                    param.name
                )));
            }
            offsets.push(names.len());
            if param.size == 1 {
                names.push(param.name.clone());
            } else {
                names.extend((0..param.size).map(|i| format!("{}_{i}", param.name)));
            }
            roles.extend(std::iter::repeat_n(param.role, param.size));
            if param.role == ParameterRole::GwRho {
                let bounds = PriorBounds::from_log10_amplitude(&param.prior);
                rho_bounds.extend(std::iter::repeat_n(bounds, param.size));
                rho_priors.extend(std::iter::repeat_n(param.prior, param.size));
            }
        }

        let positions = |role: ParameterRole| -> Vec<usize> {
            roles
                .iter()
                .enumerate()
                .filter(|(_, r)| **r == role)
                .map(|(i, _)| i)
                .collect()
        };
        let white = positions(ParameterRole::WhiteNoise);
        let red = positions(ParameterRole::RedNoise);
        let correlated = positions(ParameterRole::CorrelatedNoise);
        let gw_rho = positions(ParameterRole::GwRho);

        Ok(Self {
            descriptors: descriptors.to_vec(),
            offsets,
            names,
            roles,
            white,
            red,
            correlated,
            gw_rho,
            rho_priors,
            rho_bounds,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Flat parameter names; vector parameters expand to `name_i`.
    pub fn param_names(&self) -> &[String] {
        &self.names
    }

    pub fn role_of(&self, position: usize) -> Option<ParameterRole> {
        self.roles.get(position).copied()
    }

    pub fn indices(&self, role: ParameterRole) -> &[usize] {
        match role {
            ParameterRole::WhiteNoise => &self.white,
            ParameterRole::RedNoise => &self.red,
            ParameterRole::CorrelatedNoise => &self.correlated,
            ParameterRole::GwRho => &self.gw_rho,
        }
    }

    /// `log10` amplitude prior of each GW-rho position, in flat order.
    pub fn rho_priors(&self) -> &[BoundedPrior] {
        &self.rho_priors
    }

    /// Variance bounds of each GW-rho position, in flat order.
    pub fn rho_bounds(&self) -> &[PriorBounds] {
        &self.rho_bounds
    }

    pub fn check_vector(&self, x: ArrayView1<'_, f64>) -> Result<(), GibbsError> {
        if x.len() != self.len() {
            return Err(GibbsError::DimensionMismatch {
                expected: self.len(),
                found: x.len(),
            });
        }
        if let Some(pos) = x.iter().position(|v| !v.is_finite()) {
            return Err(GibbsError::InvalidParameters(format!(
                "parameter '{}' is not finite",
                self.names[pos]
            )));
        }
        Ok(())
    }

    /// Named scalar or vector views of a flat parameter vector.
    pub fn map_params(
        &self,
        x: ArrayView1<'_, f64>,
    ) -> Result<BTreeMap<String, ParamValue>, GibbsError> {
        if x.len() != self.len() {
            return Err(GibbsError::DimensionMismatch {
                expected: self.len(),
                found: x.len(),
            });
        }
        let mut out = BTreeMap::new();
        for (param, &offset) in self.descriptors.iter().zip(&self.offsets) {
            let value = if param.size == 1 {
                ParamValue::Scalar(x[offset])
            } else {
                ParamValue::Vector(x.slice(ndarray::s![offset..offset + param.size]).to_owned())
            };
            out.insert(param.name.clone(), value);
        }
        Ok(out)
    }

    /// Draw a starting vector from the declared priors.
    pub fn sample_initial<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Array1<f64> {
        let mut x = Array1::zeros(self.len());
        for (param, &offset) in self.descriptors.iter().zip(&self.offsets) {
            for k in 0..param.size {
                x[offset + k] = param.prior.sample(rng);
            }
        }
        x
    }

    /// Position of a flat name as listed by [`ParameterIndex::param_names`].
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}
