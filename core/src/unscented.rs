//! Unscented Kalman filter on an augmented state.
//!
//! The state is augmented with process and measurement noise slots so that noise injection is
//! part of the sigma-point sampling itself: the propagated point $i$ is
//! $f(t, \chi^x_i, u) + \chi^w_i$ and the measured point is $h(t, \chi^x_i) + \chi^v_i$. This
//! handles additive and non-additive noise with the same construction, which is why the
//! process noise is never added to the a-priori covariance explicitly.
//!
//! Sigma points are generated twice per update: around the previous a-posteriori estimate for
//! the prediction, and again around the a-priori estimate for the measurement update. The
//! first set of each accepted update is archived and can be read back with
//! [`UnscentedKalmanFilter::sigma_point_history`].

use std::fmt::{self, Debug, Display};

use log::{info, trace};
use nalgebra::{DMatrix, DVector};

use crate::{Commit, StateEstimator};
use crate::error::Result;
use crate::filter::{Estimate, FilterBase, InitialEstimate, Prediction};
use crate::history::{History, HistoryRetention};
use crate::integrator::IntegratorSettings;
use crate::linalg::{kalman_gain, symmetrize};
use crate::parameters::{ConstantParameterReference, ConstantParameters, CustomParameters, Weights};
use crate::sigma::{
    SigmaPointSet, augment, weighted_covariance, weighted_cross_covariance, weighted_mean,
};

/// Optional construction settings of the unscented filter
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UnscentedOptions {
    pub constant_parameter_reference: ConstantParameterReference,
    /// Only read when `constant_parameter_reference` is `Custom`
    pub custom_parameters: CustomParameters,
    /// Integrate the system function as a derivative instead of evaluating it directly
    pub integrator: Option<IntegratorSettings>,
    pub history_retention: HistoryRetention,
}

impl UnscentedOptions {
    pub fn with_reference(mut self, reference: ConstantParameterReference) -> Self {
        self.constant_parameter_reference = reference;
        self
    }
    pub fn with_custom_parameters(mut self, alpha: f64, kappa: f64) -> Self {
        self.constant_parameter_reference = ConstantParameterReference::Custom;
        self.custom_parameters = CustomParameters::new(alpha, kappa);
        self
    }
    pub fn with_integrator(mut self, integrator: IntegratorSettings) -> Self {
        self.integrator = Some(integrator);
        self
    }
    pub fn with_history_retention(mut self, retention: HistoryRetention) -> Self {
        self.history_retention = retention;
        self
    }
}

/// Unscented Kalman Filter implementation
pub struct UnscentedKalmanFilter {
    base: FilterBase,
    parameters: ConstantParameters,
    weights: Weights,
    sigma_point_history: History<SigmaPointSet>,
}

impl Debug for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UKF")
            .field("base", &self.base)
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl Display for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnscentedKalmanFilter")
            .field("time", &self.base.current_time())
            .field("state", self.base.state())
            .field("covariance", self.base.covariance())
            .field("alpha", &self.parameters.alpha)
            .field("kappa", &self.parameters.kappa)
            .field("lambda", &self.parameters.lambda)
            .finish()
    }
}

impl UnscentedKalmanFilter {
    /// Create a new unscented Kalman filter.
    ///
    /// # Arguments
    ///
    /// * `system_function` - $f(t, x, u)$, returning the next state (or its derivative when an
    ///   integrator is configured)
    /// * `measurement_function` - $h(t, x)$
    /// * `process_noise` - $Q$ (n×n)
    /// * `measurement_noise` - $R$ (m×m), which also fixes the measurement dimension
    /// * `initial` - initial time, state and covariance
    /// * `options` - tuning constants, integrator and history retention
    ///
    /// # Errors
    ///
    /// [`crate::FilterError::Configuration`] for inconsistent dimensions, invalid settings, or a
    /// `Custom` parameter reference without both alpha and kappa. No sigma point is generated
    /// before these checks pass.
    pub fn new<F, H>(
        system_function: F,
        measurement_function: H,
        process_noise: DMatrix<f64>,
        measurement_noise: DMatrix<f64>,
        initial: InitialEstimate,
        options: UnscentedOptions,
    ) -> Result<UnscentedKalmanFilter>
    where
        F: Fn(f64, &DVector<f64>, &DVector<f64>) -> DVector<f64> + Send + Sync + 'static,
        H: Fn(f64, &DVector<f64>) -> DVector<f64> + Send + Sync + 'static,
    {
        let n = initial.state.len();
        let m = measurement_noise.nrows();
        let parameters = ConstantParameters::new(
            options.constant_parameter_reference,
            options.custom_parameters,
            n,
            m,
        )?;
        let base = FilterBase::new(
            Box::new(system_function),
            Box::new(measurement_function),
            process_noise,
            measurement_noise,
            initial,
            options.integrator,
            options.history_retention,
        )?;
        let weights = Weights::new(&parameters);
        info!(
            "UKF ({}): L = {}, N = {}, alpha = {}, kappa = {}, lambda = {:.6e}, gamma = {:.6e}",
            options.constant_parameter_reference,
            parameters.augmented_dimension,
            parameters.sigma_point_count,
            parameters.alpha,
            parameters.kappa,
            parameters.lambda,
            parameters.gamma
        );
        Ok(UnscentedKalmanFilter {
            base,
            parameters,
            weights,
            sigma_point_history: History::new(options.history_retention),
        })
    }

    pub fn constant_parameters(&self) -> &ConstantParameters {
        &self.parameters
    }
    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    /// Sigma points spanning `diag(covariance, Q, R)` around `[state; 0; 0]`.
    pub fn sigma_points(
        &self,
        state: &DVector<f64>,
        covariance: &DMatrix<f64>,
    ) -> Result<SigmaPointSet> {
        let (mean, cov) = augment(
            state,
            covariance,
            self.base.process_noise(),
            self.base.measurement_noise(),
        );
        let set = SigmaPointSet::generate(&mean, &cov, self.parameters.gamma)?;
        trace!("generated {} sigma points of length {}", set.len(), set.dimension());
        Ok(set)
    }

    /// Archived sigma-point sets, one per accepted update
    pub fn sigma_point_sets(&self) -> &History<SigmaPointSet> {
        &self.sigma_point_history
    }

    /// Every archived sigma-point set as an `L × N` matrix (column j = point j), in
    /// insertion order.
    pub fn sigma_point_history(&self) -> Vec<(f64, DMatrix<f64>)> {
        self.sigma_point_history
            .iter()
            .map(|(time, set)| (time, set.to_matrix()))
            .collect()
    }
}

impl Commit for UnscentedKalmanFilter {
    fn base_mut(&mut self) -> &mut FilterBase {
        &mut self.base
    }

    fn accept(&mut self, mut estimate: Estimate) {
        if let Some(set) = estimate.sigma_points.take() {
            self.sigma_point_history.push(estimate.time, set);
        }
        self.base.accept(estimate);
    }
}

impl StateEstimator for UnscentedKalmanFilter {
    fn predict(&self, time: f64, control: &DVector<f64>) -> Result<Prediction> {
        let n = self.base.state_dimension();
        let sigma_points = self.sigma_points(self.base.state(), self.base.covariance())?;
        let propagated = sigma_points
            .iter()
            .map(|point| {
                let x = point.rows(0, n).clone_owned();
                let w = point.rows(n, n).clone_owned();
                self.base.predict_state(time, &x, control, Some(&w))
            })
            .collect::<Result<Vec<_>>>()?;
        let state = weighted_mean(&propagated, &self.weights.mean);
        let covariance = symmetrize(&weighted_covariance(
            &propagated,
            &state,
            &self.weights.covariance,
        ));
        Ok(Prediction {
            time,
            state,
            covariance,
            sigma_points: Some(sigma_points),
        })
    }

    fn correct(&self, prediction: Prediction, measurement: &DVector<f64>) -> Result<Estimate> {
        self.base.check_measurement(measurement)?;
        let n = self.base.state_dimension();
        let m = self.base.measurement_dimension();
        // Re-sample around the a-priori estimate
        let sigma_points = self.sigma_points(&prediction.state, &prediction.covariance)?;
        let states: Vec<DVector<f64>> = sigma_points
            .iter()
            .map(|point| point.rows(0, n).clone_owned())
            .collect();
        let measurements = sigma_points
            .iter()
            .zip(states.iter())
            .map(|(point, x)| {
                let v = point.rows(2 * n, m).clone_owned();
                self.base.predict_measurement(prediction.time, x, Some(&v))
            })
            .collect::<Result<Vec<_>>>()?;

        let predicted_measurement = weighted_mean(&measurements, &self.weights.mean);
        let innovation = symmetrize(&weighted_covariance(
            &measurements,
            &predicted_measurement,
            &self.weights.covariance,
        ));
        let cross_correlation = weighted_cross_covariance(
            &states,
            &prediction.state,
            &measurements,
            &predicted_measurement,
            &self.weights.covariance,
        );
        let gain = kalman_gain(&cross_correlation, &innovation)?;

        let state = FilterBase::correct_state(
            &prediction.state,
            measurement,
            &predicted_measurement,
            &gain,
        );
        let covariance = symmetrize(&(&prediction.covariance - &gain * &innovation * gain.transpose()));
        let estimate = Estimate {
            time: prediction.time,
            state,
            covariance,
            residual: measurement - predicted_measurement,
            sigma_points: prediction.sigma_points,
        };
        self.base.check_estimate(&estimate)?;
        Ok(estimate)
    }

    fn base(&self) -> &FilterBase {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FilterError;
    use assert_approx_eq::assert_approx_eq;

    fn constant_velocity(options: UnscentedOptions) -> Result<UnscentedKalmanFilter> {
        let dt = 1.0;
        UnscentedKalmanFilter::new(
            move |_, x: &DVector<f64>, _: &DVector<f64>| {
                DVector::from_vec(vec![x[0] + x[1] * dt, x[1]])
            },
            |_, x: &DVector<f64>| DVector::from_vec(vec![x[0]]),
            DMatrix::from_diagonal(&DVector::from_vec(vec![0.01, 0.01])),
            DMatrix::from_element(1, 1, 0.1),
            InitialEstimate::new(0.0, DVector::from_vec(vec![0.0, 1.0]), DMatrix::identity(2, 2)),
            options,
        )
    }

    #[test]
    fn ukf_construction() {
        let ukf = constant_velocity(UnscentedOptions::default()).unwrap();
        let p = ukf.constant_parameters();
        assert_eq!(p.augmented_dimension, 5);
        assert_eq!(p.sigma_point_count, 11);
        assert_eq!(ukf.weights().len(), 11);
        assert_eq!(ukf.get_current_time(), 0.0);
        assert!(ukf.state_history().is_empty());
        assert!(ukf.sigma_point_history().is_empty());
    }

    #[test]
    fn ukf_custom_without_values_fails() {
        let options = UnscentedOptions::default().with_reference(ConstantParameterReference::Custom);
        match constant_velocity(options) {
            Err(FilterError::Configuration(_)) => {}
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn ukf_sigma_points_of_current_estimate() {
        let ukf = constant_velocity(UnscentedOptions::default().with_custom_parameters(1.0, 0.0))
            .unwrap();
        let set = ukf
            .sigma_points(ukf.get_estimate(), ukf.get_certainty())
            .unwrap();
        assert_eq!(set.len(), 11);
        assert_eq!(set.dimension(), 5);
        let mean = set.mean(ukf.weights());
        assert_approx_eq!(mean[0], 0.0, 1e-12);
        assert_approx_eq!(mean[1], 1.0, 1e-12);
        for i in 2..5 {
            assert_approx_eq!(mean[i], 0.0, 1e-12);
        }
    }

    #[test]
    fn ukf_predict_is_pure() {
        let ukf = constant_velocity(UnscentedOptions::default()).unwrap();
        let a = ukf.predict(1.0, &DVector::zeros(0)).unwrap();
        let b = ukf.predict(1.0, &DVector::zeros(0)).unwrap();
        assert_eq!(a, b);
        assert_approx_eq!(a.state[0], 1.0, 1e-6);
        assert_approx_eq!(a.state[1], 1.0, 1e-6);
        // F P Fᵀ + Q with F = [1 1; 0 1], P = I
        assert_approx_eq!(a.covariance[(0, 0)], 2.01, 1e-6);
        assert_approx_eq!(a.covariance[(0, 1)], 1.0, 1e-6);
        assert_approx_eq!(a.covariance[(1, 1)], 1.01, 1e-6);
        assert!(ukf.state_history().is_empty());
    }

    #[test]
    fn ukf_update_archives_everything() {
        let mut ukf = constant_velocity(UnscentedOptions::default()).unwrap();
        for k in 1..=5 {
            let z = DVector::from_vec(vec![k as f64 * 1.02]);
            ukf.update_filter(k as f64, &DVector::zeros(0), &z).unwrap();
        }
        assert_eq!(ukf.state_history().len(), 5);
        assert_eq!(ukf.covariance_history().len(), 5);
        let sigma = ukf.sigma_point_history();
        assert_eq!(sigma.len(), 5);
        assert_eq!(sigma[0].0, 1.0);
        assert_eq!(sigma[4].0, 5.0);
        assert_eq!(sigma[0].1.shape(), (5, 11));
        // first column of the first archived set is the initial augmented mean
        assert_eq!(sigma[0].1.column(0).as_slice(), &[0.0, 1.0, 0.0, 0.0, 0.0]);
        assert_eq!(ukf.get_current_time(), 5.0);
    }

    #[test]
    fn ukf_bounded_history() {
        let mut ukf = constant_velocity(
            UnscentedOptions::default().with_history_retention(HistoryRetention::Bounded(2)),
        )
        .unwrap();
        for k in 1..=4 {
            ukf.update_filter(k as f64, &DVector::zeros(0), &DVector::from_vec(vec![k as f64]))
                .unwrap();
        }
        assert_eq!(ukf.state_history().len(), 2);
        assert_eq!(ukf.sigma_point_history().len(), 2);
        assert_eq!(ukf.state_history().times().collect::<Vec<_>>(), vec![3.0, 4.0]);
    }

    #[test]
    fn ukf_wrong_measurement_length_is_rejected() {
        let mut ukf = constant_velocity(UnscentedOptions::default()).unwrap();
        let err = ukf
            .update_filter(1.0, &DVector::zeros(0), &DVector::from_vec(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(ukf.state_history().is_empty());
        assert_eq!(ukf.get_estimate().as_slice(), &[0.0, 1.0]);
    }
}
