//! Unscented transform tuning constants and sigma-point weights.
//!
//! The scaled unscented transform is driven by three user-facing constants:
//!
//! - $\alpha$ spreads the sigma points around the mean,
//! - $\beta$ encodes prior knowledge of the distribution ($\beta = 2$ is optimal for Gaussians),
//! - $\kappa$ is a secondary scaling parameter.
//!
//! From these and the augmented dimension $L = 2n + m$ (state dimension $n$, measurement
//! dimension $m$) the derived constants are
//!
//! $$
//! \lambda = \alpha^2 (L + \kappa) - L, \qquad \gamma = \sqrt{L + \lambda}
//! $$
//!
//! and the $N = 2L + 1$ weights
//!
//! $$
//! W^{(m)}_0 = \frac{\lambda}{L + \lambda}, \quad
//! W^{(c)}_0 = W^{(m)}_0 + (1 - \alpha^2 + \beta), \quad
//! W^{(m)}_i = W^{(c)}_i = \frac{1}{2(L + \lambda)}
//! $$
//!
//! Literature presets fix $\alpha$ and $\kappa$ and live in the [`PRESETS`] table.
//!
//! # References
//! - Wan, E. and Van Der Merwe, R., "The Unscented Kalman Filter for Nonlinear Estimation", 2000.
//! - Jah, M., Lisano, M., Born, G., and Axelrad, P., "Mars Aerobraking Spacecraft State Estimation
//!   By Processing Inertial Measurement Unit Data", JGCD 31(6), 2008.
//! - Challa, M., Moore, J., and Rogers, D., "A Simple Attitude Unscented Kalman Filter: Theory and
//!   Evaluation in a Magnetometer-Only Spacecraft Scenario", IEEE Access 4, 2016.

use std::fmt::{self, Display};
use std::str::FromStr;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};

/// Distribution parameter used by every preset
pub const BETA: f64 = 2.0;

/// Source of the $\alpha$ and $\kappa$ tuning constants
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstantParameterReference {
    /// Wan and Van Der Merwe (2000): alpha = 0.003, kappa = 0
    #[default]
    WanVanDerMerwe,
    /// Lisano, Born and Axelrad (2008): alpha = 1, kappa = 3 - n
    LisanoBornAxelrad,
    /// Challa, Moore and Rogers (2016): alpha = 0.001, kappa = 1
    ChallaMooreRogers,
    /// User supplied alpha and kappa
    Custom,
}

/// How a preset derives kappa
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KappaRule {
    Fixed(f64),
    /// kappa = 3 - n, with n the state dimension
    ThreeMinusStateDimension,
}

impl KappaRule {
    pub fn kappa(&self, state_dimension: usize) -> f64 {
        match self {
            KappaRule::Fixed(k) => *k,
            KappaRule::ThreeMinusStateDimension => 3.0 - state_dimension as f64,
        }
    }
}

/// One row of the literature preset table
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Preset {
    pub reference: ConstantParameterReference,
    pub name: &'static str,
    pub alpha: f64,
    pub kappa: KappaRule,
}

/// Literature presets. `Custom` is intentionally absent.
pub const PRESETS: [Preset; 3] = [
    Preset {
        reference: ConstantParameterReference::WanVanDerMerwe,
        name: "wan_van_der_merwe",
        alpha: 0.003,
        kappa: KappaRule::Fixed(0.0),
    },
    Preset {
        reference: ConstantParameterReference::LisanoBornAxelrad,
        name: "lisano_born_axelrad",
        alpha: 1.0,
        kappa: KappaRule::ThreeMinusStateDimension,
    },
    Preset {
        reference: ConstantParameterReference::ChallaMooreRogers,
        name: "challa_moore_rogers",
        alpha: 0.001,
        kappa: KappaRule::Fixed(1.0),
    },
];

impl ConstantParameterReference {
    /// Preset table row, `None` for [`ConstantParameterReference::Custom`]
    pub fn preset(&self) -> Option<&'static Preset> {
        PRESETS.iter().find(|p| p.reference == *self)
    }
    pub fn name(&self) -> &'static str {
        match self.preset() {
            Some(p) => p.name,
            None => "custom",
        }
    }
}

impl Display for ConstantParameterReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ConstantParameterReference {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_lowercase().replace('-', "_");
        if key == "custom" {
            return Ok(ConstantParameterReference::Custom);
        }
        PRESETS
            .iter()
            .find(|p| p.name == key || p.name.split('_').next() == Some(key.as_str()))
            .map(|p| p.reference)
            .ok_or_else(|| {
                FilterError::configuration(format!("unknown constant parameter reference '{s}'"))
            })
    }
}

/// Custom alpha/kappa pair. Either value may be missing; NaN counts as missing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomParameters {
    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub kappa: Option<f64>,
}

impl CustomParameters {
    pub fn new(alpha: f64, kappa: f64) -> Self {
        CustomParameters {
            alpha: Some(alpha),
            kappa: Some(kappa),
        }
    }
    fn resolved(&self) -> Option<(f64, f64)> {
        match (self.alpha, self.kappa) {
            (Some(a), Some(k)) if !a.is_nan() && !k.is_nan() => Some((a, k)),
            _ => None,
        }
    }
}

/// Scalar tuning constants of the scaled unscented transform
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ConstantParameters {
    pub alpha: f64,
    pub beta: f64,
    pub kappa: f64,
    pub lambda: f64,
    pub gamma: f64,
    /// n
    pub state_dimension: usize,
    /// m
    pub measurement_dimension: usize,
    /// L = 2n + m
    pub augmented_dimension: usize,
    /// N = 2L + 1
    pub sigma_point_count: usize,
}

impl ConstantParameters {
    /// Resolve the constants from a preset or custom values.
    ///
    /// Fails with [`FilterError::Configuration`] when `Custom` is selected and either
    /// value is missing, or when the resulting scaling is degenerate.
    pub fn new(
        reference: ConstantParameterReference,
        custom: CustomParameters,
        state_dimension: usize,
        measurement_dimension: usize,
    ) -> Result<Self> {
        let (alpha, kappa) = match reference.preset() {
            Some(preset) => (preset.alpha, preset.kappa.kappa(state_dimension)),
            None => custom.resolved().ok_or_else(|| {
                FilterError::configuration(
                    "custom constant parameters selected but alpha and kappa are not both specified",
                )
            })?,
        };
        Self::from_alpha_kappa(alpha, kappa, state_dimension, measurement_dimension)
    }

    /// Derive lambda and gamma for explicit alpha and kappa.
    pub fn from_alpha_kappa(
        alpha: f64,
        kappa: f64,
        state_dimension: usize,
        measurement_dimension: usize,
    ) -> Result<Self> {
        if !alpha.is_finite() || !kappa.is_finite() {
            return Err(FilterError::configuration(format!(
                "alpha ({alpha}) and kappa ({kappa}) must be finite"
            )));
        }
        if state_dimension == 0 {
            return Err(FilterError::configuration("state dimension must be positive"));
        }
        let augmented_dimension = 2 * state_dimension + measurement_dimension;
        let l = augmented_dimension as f64;
        let lambda = alpha.powi(2) * (l + kappa) - l;
        let spread = l + lambda;
        if !(spread > 0.0) {
            return Err(FilterError::configuration(format!(
                "L + lambda must be positive, got {spread} (alpha = {alpha}, kappa = {kappa}, L = {augmented_dimension})"
            )));
        }
        Ok(ConstantParameters {
            alpha,
            beta: BETA,
            kappa,
            lambda,
            gamma: spread.sqrt(),
            state_dimension,
            measurement_dimension,
            augmented_dimension,
            sigma_point_count: 2 * augmented_dimension + 1,
        })
    }
}

/// Mean and covariance weights, one per sigma point
#[derive(Clone, Debug, PartialEq)]
pub struct Weights {
    pub mean: DVector<f64>,
    pub covariance: DVector<f64>,
}

impl Weights {
    pub fn new(parameters: &ConstantParameters) -> Weights {
        let l = parameters.augmented_dimension as f64;
        let spread = l + parameters.lambda;
        let mut mean = DVector::from_element(parameters.sigma_point_count, 1.0 / (2.0 * spread));
        mean[0] = parameters.lambda / spread;
        let mut covariance = mean.clone();
        covariance[0] += 1.0 - parameters.alpha.powi(2) + parameters.beta;
        Weights { mean, covariance }
    }
    pub fn len(&self) -> usize {
        self.mean.len()
    }
    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }
}
