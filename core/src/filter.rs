//! Recursive filter base shared by every estimator variant.
//!
//! [`FilterBase`] owns the system and measurement models, the fixed noise covariances, the
//! current a-posteriori estimate and the state/covariance histories. It provides the two
//! building blocks every variant reuses:
//!
//! - [`FilterBase::predict_state`]: evaluate the system model directly, or integrate its
//!   differential form when [`IntegratorSettings`] were supplied,
//! - [`FilterBase::correct_state`]: $x^+ = x^- + K (z - \hat{z})$.
//!
//! Process and measurement noise samples are explicit arguments to model evaluation; there
//! is no hidden per-call state.

use std::fmt::{self, Debug};

use log::{debug, info};
use nalgebra::{DMatrix, DVector};

use crate::error::{FilterError, Result};
use crate::history::{History, HistoryRetention};
use crate::integrator::IntegratorSettings;
use crate::linalg::asymmetry;

/// System model $x_k = f(t, x_{k-1}, u)$, or $\dot{x} = f(t, x, u)$ when integrating
pub type SystemFunction = Box<dyn Fn(f64, &DVector<f64>, &DVector<f64>) -> DVector<f64> + Send + Sync>;
/// Measurement model $z = h(t, x)$
pub type MeasurementFunction = Box<dyn Fn(f64, &DVector<f64>) -> DVector<f64> + Send + Sync>;

/// Relative tolerance for symmetry of user supplied covariances
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Starting point of a filter
#[derive(Clone, Debug, PartialEq)]
pub struct InitialEstimate {
    pub time: f64,
    pub state: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

impl InitialEstimate {
    pub fn new(time: f64, state: DVector<f64>, covariance: DMatrix<f64>) -> Self {
        InitialEstimate {
            time,
            state,
            covariance,
        }
    }
}

/// A-priori estimate produced by [`crate::StateEstimator::predict`]
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub time: f64,
    pub state: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// Augmented sigma points the prediction was built from (unscented filter only)
    pub sigma_points: Option<crate::sigma::SigmaPointSet>,
}

/// A-posteriori estimate produced by [`crate::StateEstimator::correct`]
#[derive(Clone, Debug, PartialEq)]
pub struct Estimate {
    pub time: f64,
    pub state: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// z - ẑ
    pub residual: DVector<f64>,
    pub sigma_points: Option<crate::sigma::SigmaPointSet>,
}

pub struct FilterBase {
    system_function: SystemFunction,
    measurement_function: MeasurementFunction,
    process_noise: DMatrix<f64>,
    measurement_noise: DMatrix<f64>,
    integrator: Option<IntegratorSettings>,
    /// Required control length, when the system model fixes one
    control_dimension: Option<usize>,
    current_time: f64,
    state: DVector<f64>,
    covariance: DMatrix<f64>,
    state_history: History<DVector<f64>>,
    covariance_history: History<DMatrix<f64>>,
}

impl Debug for FilterBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterBase")
            .field("current_time", &self.current_time)
            .field("state", &self.state)
            .field("covariance", &self.covariance)
            .field("process_noise", &self.process_noise)
            .field("measurement_noise", &self.measurement_noise)
            .field("integrator", &self.integrator)
            .field("history_len", &self.state_history.len())
            .finish()
    }
}

fn check_covariance(name: &str, matrix: &DMatrix<f64>, dimension: usize) -> Result<()> {
    if matrix.shape() != (dimension, dimension) {
        return Err(FilterError::configuration(format!(
            "{name} must be {dimension}x{dimension}, got {}x{}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(FilterError::configuration(format!(
            "{name} has non-finite entries"
        )));
    }
    if asymmetry(matrix) > SYMMETRY_TOLERANCE * matrix.amax().max(1.0) {
        return Err(FilterError::configuration(format!("{name} is not symmetric")));
    }
    Ok(())
}

impl FilterBase {
    /// Validate dimensions and build the base.
    ///
    /// The state dimension `n` comes from the initial state, the measurement dimension `m`
    /// from the measurement noise covariance.
    pub fn new(
        system_function: SystemFunction,
        measurement_function: MeasurementFunction,
        process_noise: DMatrix<f64>,
        measurement_noise: DMatrix<f64>,
        initial: InitialEstimate,
        integrator: Option<IntegratorSettings>,
        retention: HistoryRetention,
    ) -> Result<FilterBase> {
        let n = initial.state.len();
        if n == 0 {
            return Err(FilterError::configuration("initial state must not be empty"));
        }
        if initial.state.iter().any(|v| !v.is_finite()) || !initial.time.is_finite() {
            return Err(FilterError::configuration(
                "initial time and state must be finite",
            ));
        }
        check_covariance("initial covariance", &initial.covariance, n)?;
        check_covariance("process noise covariance", &process_noise, n)?;
        let m = measurement_noise.nrows();
        if m == 0 {
            return Err(FilterError::configuration(
                "measurement noise covariance must not be empty",
            ));
        }
        check_covariance("measurement noise covariance", &measurement_noise, m)?;
        if let Some(settings) = &integrator {
            settings.validate()?;
        }
        retention.validate()?;
        info!(
            "filter base: n = {n}, m = {m}, t0 = {}, propagation = {}",
            initial.time,
            match &integrator {
                Some(s) => format!("{:?} (h = {})", s.method, s.step_size),
                None => "direct".to_string(),
            }
        );
        Ok(FilterBase {
            system_function,
            measurement_function,
            process_noise,
            measurement_noise,
            integrator,
            control_dimension: None,
            current_time: initial.time,
            state: initial.state,
            covariance: initial.covariance,
            state_history: History::new(retention),
            covariance_history: History::new(retention),
        })
    }

    /// Reject controls of any other length than `dimension` in [`FilterBase::predict_state`].
    pub(crate) fn set_control_dimension(&mut self, dimension: usize) {
        self.control_dimension = Some(dimension);
    }

    /// Predicted state at `time` from `previous_state`.
    ///
    /// Without an integrator the system model is evaluated once at `time`. With one, the
    /// model is the derivative and is integrated from the current a-posteriori time to
    /// `time`. `process_noise`, when given, is added to the model output.
    pub fn predict_state(
        &self,
        time: f64,
        previous_state: &DVector<f64>,
        control: &DVector<f64>,
        process_noise: Option<&DVector<f64>>,
    ) -> Result<DVector<f64>> {
        let n = self.state_dimension();
        if let Some(p) = self.control_dimension
            && control.len() != p
        {
            return Err(FilterError::configuration(format!(
                "control has {} values, expected {p}",
                control.len()
            )));
        }
        let model = |t: f64, x: &DVector<f64>| -> DVector<f64> {
            let fx = (self.system_function)(t, x, control);
            match process_noise {
                Some(w) if fx.len() == w.len() => fx + w,
                _ => fx,
            }
        };
        let predicted = match &self.integrator {
            None => model(time, previous_state),
            Some(settings) => {
                let probe = (self.system_function)(self.current_time, previous_state, control);
                if probe.len() != n {
                    return Err(FilterError::configuration(format!(
                        "system function returned {} values, expected {n}",
                        probe.len()
                    )));
                }
                settings.integrate(model, self.current_time, previous_state, time)?
            }
        };
        if predicted.len() != n {
            return Err(FilterError::configuration(format!(
                "system function returned {} values, expected {n}",
                predicted.len()
            )));
        }
        Ok(predicted)
    }

    /// Expected measurement for `state` at `time`, plus the optional noise sample.
    pub fn predict_measurement(
        &self,
        time: f64,
        state: &DVector<f64>,
        measurement_noise: Option<&DVector<f64>>,
    ) -> Result<DVector<f64>> {
        let m = self.measurement_dimension();
        let mut z = (self.measurement_function)(time, state);
        if z.len() != m {
            return Err(FilterError::configuration(format!(
                "measurement function returned {} values, expected {m}",
                z.len()
            )));
        }
        if let Some(v) = measurement_noise {
            z += v;
        }
        Ok(z)
    }

    /// $x^+ = x^- + K (z - \hat{z})$
    pub fn correct_state(
        prior_state: &DVector<f64>,
        measurement: &DVector<f64>,
        predicted_measurement: &DVector<f64>,
        gain: &DMatrix<f64>,
    ) -> DVector<f64> {
        prior_state + gain * (measurement - predicted_measurement)
    }

    /// Dimension checks shared by every variant's `correct`
    pub fn check_measurement(&self, measurement: &DVector<f64>) -> Result<()> {
        if measurement.len() != self.measurement_dimension() {
            return Err(FilterError::configuration(format!(
                "measurement has {} values, expected {}",
                measurement.len(),
                self.measurement_dimension()
            )));
        }
        if measurement.iter().any(|v| !v.is_finite()) {
            return Err(FilterError::configuration("measurement has non-finite values"));
        }
        Ok(())
    }

    /// Reject a-posteriori results that are no longer finite.
    pub fn check_estimate(&self, estimate: &Estimate) -> Result<()> {
        if estimate.state.iter().any(|v| !v.is_finite())
            || estimate.covariance.iter().any(|v| !v.is_finite())
        {
            return Err(FilterError::numerical(format!(
                "non-finite a-posteriori estimate at t = {}",
                estimate.time
            )));
        }
        Ok(())
    }

    /// Store `estimate` as the current a-posteriori estimate and archive it under its time.
    pub(crate) fn accept(&mut self, estimate: Estimate) {
        debug!(
            "t = {}: |residual| = {:.6e}, trace(P) = {:.6e}",
            estimate.time,
            estimate.residual.norm(),
            estimate.covariance.trace()
        );
        self.current_time = estimate.time;
        self.state_history.push(estimate.time, estimate.state.clone());
        self.covariance_history
            .push(estimate.time, estimate.covariance.clone());
        self.state = estimate.state;
        self.covariance = estimate.covariance;
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.state
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
    pub fn current_time(&self) -> f64 {
        self.current_time
    }
    pub fn process_noise(&self) -> &DMatrix<f64> {
        &self.process_noise
    }
    pub fn measurement_noise(&self) -> &DMatrix<f64> {
        &self.measurement_noise
    }
    pub fn integrator(&self) -> Option<&IntegratorSettings> {
        self.integrator.as_ref()
    }
    pub fn control_dimension(&self) -> Option<usize> {
        self.control_dimension
    }
    pub fn state_dimension(&self) -> usize {
        self.state.len()
    }
    pub fn measurement_dimension(&self) -> usize {
        self.measurement_noise.nrows()
    }
    pub fn retention(&self) -> HistoryRetention {
        self.state_history.retention()
    }
    pub fn state_history(&self) -> &History<DVector<f64>> {
        &self.state_history
    }
    pub fn covariance_history(&self) -> &History<DMatrix<f64>> {
        &self.covariance_history
    }
}
