//! Linear and extended Kalman filters.
//!
//! Both filters sit on the same [`FilterBase`] as the unscented filter and implement
//! [`StateEstimator`], so they can be swapped at construction time (see
//! [`crate::config::create_filter`]). They are discrete-time: the system model maps the
//! previous state directly to the state at the requested time.
//!
//! ## Predict Step
//!
//! $$
//! \begin{aligned}
//! \bar{x}_{k} &= f(x_{k-1}, u_k) \\\\
//! \bar{P}_{k} &= F_k P_{k-1} F_k^T + Q
//! \end{aligned}
//! $$
//!
//! ## Update Step
//!
//! $$
//! \begin{aligned}
//! S_k &= H_k \bar{P}_k H_k^T + R \\\\
//! K_k &= \bar{P}_k H_k^T S_k^{-1} \\\\
//! x_k &= \bar{x}_k + K_k (z_k - h(\bar{x}_k)) \\\\
//! P_k &= \bar{P}_k - K_k S_k K_k^T
//! \end{aligned}
//! $$
//!
//! For the linear filter $f(x, u) = A x + B u$, $h(x) = H x$ and the Jacobians are the
//! matrices themselves. For the extended filter $F_k$ and $H_k$ come from user supplied
//! Jacobian functions evaluated at the current estimate.

use std::fmt::{self, Debug};

use log::info;
use nalgebra::{DMatrix, DVector};

use crate::{Commit, StateEstimator};
use crate::error::{FilterError, Result};
use crate::filter::{
    Estimate, FilterBase, InitialEstimate, MeasurementFunction, Prediction, SystemFunction,
};
use crate::history::HistoryRetention;
use crate::linalg::{kalman_gain, symmetrize};

/// $F = \partial f / \partial x$ evaluated at `(time, state, control)`
pub type SystemJacobian = Box<dyn Fn(f64, &DVector<f64>, &DVector<f64>) -> DMatrix<f64> + Send + Sync>;
/// $H = \partial h / \partial x$ evaluated at `(time, state)`
pub type MeasurementJacobian = Box<dyn Fn(f64, &DVector<f64>) -> DMatrix<f64> + Send + Sync>;

/// Shared measurement update once $\hat{z}$ and $H$ are known.
fn linearized_correction(
    base: &FilterBase,
    prediction: Prediction,
    measurement: &DVector<f64>,
    predicted_measurement: DVector<f64>,
    h: &DMatrix<f64>,
) -> Result<Estimate> {
    let p_h_t = &prediction.covariance * h.transpose();
    let innovation = symmetrize(&(h * &p_h_t + base.measurement_noise()));
    let gain = kalman_gain(&p_h_t, &innovation)?;
    let state = FilterBase::correct_state(&prediction.state, measurement, &predicted_measurement, &gain);
    let covariance = symmetrize(&(&prediction.covariance - &gain * &innovation * gain.transpose()));
    let estimate = Estimate {
        time: prediction.time,
        state,
        covariance,
        residual: measurement - predicted_measurement,
        sigma_points: None,
    };
    base.check_estimate(&estimate)?;
    Ok(estimate)
}

fn check_jacobian(name: &str, j: &DMatrix<f64>, rows: usize, cols: usize) -> Result<()> {
    if j.shape() != (rows, cols) {
        return Err(FilterError::configuration(format!(
            "{name} must be {rows}x{cols}, got {}x{}",
            j.nrows(),
            j.ncols()
        )));
    }
    Ok(())
}

/// Shapes of $A$ (n×n), $B$ (n×p) and $H$ (m×n) for state dimension `n` and measurement
/// dimension `m`.
pub(crate) fn check_linear_models(
    system_matrix: &DMatrix<f64>,
    control_matrix: &DMatrix<f64>,
    measurement_matrix: &DMatrix<f64>,
    n: usize,
    m: usize,
) -> Result<()> {
    check_jacobian("system matrix", system_matrix, n, n)?;
    check_jacobian("control matrix", control_matrix, n, control_matrix.ncols())?;
    check_jacobian("measurement matrix", measurement_matrix, m, n)
}

/// $f(x, u) = A x + B u$ and $h(x) = H x$ as boxed models
pub(crate) fn linear_models(
    system_matrix: &DMatrix<f64>,
    control_matrix: &DMatrix<f64>,
    measurement_matrix: &DMatrix<f64>,
) -> (SystemFunction, MeasurementFunction) {
    let (a, b, h) = (
        system_matrix.clone(),
        control_matrix.clone(),
        measurement_matrix.clone(),
    );
    (
        Box::new(move |_, x, u| {
            if b.ncols() == 0 {
                &a * x
            } else {
                &a * x + &b * u
            }
        }),
        Box::new(move |_, x| &h * x),
    )
}

/// Linear Kalman filter: $x_k = A x_{k-1} + B u_k + w$, $z_k = H x_k + v$
pub struct LinearKalmanFilter {
    base: FilterBase,
    system_matrix: DMatrix<f64>,
    control_matrix: DMatrix<f64>,
    measurement_matrix: DMatrix<f64>,
}

impl Debug for LinearKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearKalmanFilter")
            .field("base", &self.base)
            .field("system_matrix", &self.system_matrix)
            .field("control_matrix", &self.control_matrix)
            .field("measurement_matrix", &self.measurement_matrix)
            .finish()
    }
}

impl LinearKalmanFilter {
    /// Create a new linear Kalman filter.
    ///
    /// * `system_matrix` - $A$ (n×n)
    /// * `control_matrix` - $B$ (n×p), p may be zero
    /// * `measurement_matrix` - $H$ (m×n)
    pub fn new(
        system_matrix: DMatrix<f64>,
        control_matrix: DMatrix<f64>,
        measurement_matrix: DMatrix<f64>,
        process_noise: DMatrix<f64>,
        measurement_noise: DMatrix<f64>,
        initial: InitialEstimate,
        retention: HistoryRetention,
    ) -> Result<LinearKalmanFilter> {
        let n = initial.state.len();
        let m = measurement_noise.nrows();
        check_linear_models(&system_matrix, &control_matrix, &measurement_matrix, n, m)?;
        let (system_function, measurement_function) =
            linear_models(&system_matrix, &control_matrix, &measurement_matrix);
        let mut base = FilterBase::new(
            system_function,
            measurement_function,
            process_noise,
            measurement_noise,
            initial,
            None,
            retention,
        )?;
        base.set_control_dimension(control_matrix.ncols());
        info!("linear Kalman filter: n = {n}, m = {m}, p = {}", control_matrix.ncols());
        Ok(LinearKalmanFilter {
            base,
            system_matrix,
            control_matrix,
            measurement_matrix,
        })
    }
}

impl Commit for LinearKalmanFilter {
    fn base_mut(&mut self) -> &mut FilterBase {
        &mut self.base
    }
}

impl StateEstimator for LinearKalmanFilter {
    fn predict(&self, time: f64, control: &DVector<f64>) -> Result<Prediction> {
        let a = &self.system_matrix;
        let state = self.base.predict_state(time, self.base.state(), control, None)?;
        let covariance = symmetrize(&(a * self.base.covariance() * a.transpose() + self.base.process_noise()));
        Ok(Prediction {
            time,
            state,
            covariance,
            sigma_points: None,
        })
    }

    fn correct(&self, prediction: Prediction, measurement: &DVector<f64>) -> Result<Estimate> {
        self.base.check_measurement(measurement)?;
        let z_hat = self.base.predict_measurement(prediction.time, &prediction.state, None)?;
        linearized_correction(&self.base, prediction, measurement, z_hat, &self.measurement_matrix)
    }

    fn base(&self) -> &FilterBase {
        &self.base
    }
}

/// Extended Kalman Filter (EKF) implementation
///
/// The EKF linearizes the system and measurement models with first-order Taylor series
/// approximations, using user supplied Jacobians:
/// - `system_jacobian(t, x, u)` = $\partial f / \partial x$ at the previous a-posteriori state,
/// - `measurement_jacobian(t, x)` = $\partial h / \partial x$ at the a-priori state.
pub struct ExtendedKalmanFilter {
    base: FilterBase,
    system_jacobian: SystemJacobian,
    measurement_jacobian: MeasurementJacobian,
}

impl Debug for ExtendedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EKF").field("base", &self.base).finish()
    }
}

impl ExtendedKalmanFilter {
    #[allow(clippy::too_many_arguments)]
    pub fn new<F, H, FJ, HJ>(
        system_function: F,
        measurement_function: H,
        system_jacobian: FJ,
        measurement_jacobian: HJ,
        process_noise: DMatrix<f64>,
        measurement_noise: DMatrix<f64>,
        initial: InitialEstimate,
        retention: HistoryRetention,
    ) -> Result<ExtendedKalmanFilter>
    where
        F: Fn(f64, &DVector<f64>, &DVector<f64>) -> DVector<f64> + Send + Sync + 'static,
        H: Fn(f64, &DVector<f64>) -> DVector<f64> + Send + Sync + 'static,
        FJ: Fn(f64, &DVector<f64>, &DVector<f64>) -> DMatrix<f64> + Send + Sync + 'static,
        HJ: Fn(f64, &DVector<f64>) -> DMatrix<f64> + Send + Sync + 'static,
    {
        Self::from_boxed(
            Box::new(system_function),
            Box::new(measurement_function),
            Box::new(system_jacobian),
            Box::new(measurement_jacobian),
            process_noise,
            measurement_noise,
            initial,
            retention,
        )
    }

    /// Same as [`ExtendedKalmanFilter::new`] for already boxed models.
    #[allow(clippy::too_many_arguments)]
    pub fn from_boxed(
        system_function: SystemFunction,
        measurement_function: MeasurementFunction,
        system_jacobian: SystemJacobian,
        measurement_jacobian: MeasurementJacobian,
        process_noise: DMatrix<f64>,
        measurement_noise: DMatrix<f64>,
        initial: InitialEstimate,
        retention: HistoryRetention,
    ) -> Result<ExtendedKalmanFilter> {
        let base = FilterBase::new(
            system_function,
            measurement_function,
            process_noise,
            measurement_noise,
            initial,
            None,
            retention,
        )?;
        info!(
            "extended Kalman filter: n = {}, m = {}",
            base.state_dimension(),
            base.measurement_dimension()
        );
        Ok(ExtendedKalmanFilter {
            base,
            system_jacobian,
            measurement_jacobian,
        })
    }
}

impl Commit for ExtendedKalmanFilter {
    fn base_mut(&mut self) -> &mut FilterBase {
        &mut self.base
    }
}

impl StateEstimator for ExtendedKalmanFilter {
    fn predict(&self, time: f64, control: &DVector<f64>) -> Result<Prediction> {
        let n = self.base.state_dimension();
        let x = self.base.state();
        let f = (self.system_jacobian)(time, x, control);
        check_jacobian("system Jacobian", &f, n, n)?;
        let state = self.base.predict_state(time, x, control, None)?;
        let covariance = symmetrize(&(&f * self.base.covariance() * f.transpose() + self.base.process_noise()));
        Ok(Prediction {
            time,
            state,
            covariance,
            sigma_points: None,
        })
    }

    fn correct(&self, prediction: Prediction, measurement: &DVector<f64>) -> Result<Estimate> {
        self.base.check_measurement(measurement)?;
        let h = (self.measurement_jacobian)(prediction.time, &prediction.state);
        check_jacobian(
            "measurement Jacobian",
            &h,
            self.base.measurement_dimension(),
            self.base.state_dimension(),
        )?;
        let z_hat = self.base.predict_measurement(prediction.time, &prediction.state, None)?;
        linearized_correction(&self.base, prediction, measurement, z_hat, &h)
    }

    fn base(&self) -> &FilterBase {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn cv_linear() -> LinearKalmanFilter {
        LinearKalmanFilter::new(
            DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
            DMatrix::zeros(2, 0),
            DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            DMatrix::identity(2, 2) * 0.01,
            DMatrix::from_element(1, 1, 0.1),
            InitialEstimate::new(0.0, DVector::from_vec(vec![0.0, 1.0]), DMatrix::identity(2, 2)),
            HistoryRetention::Full,
        )
        .unwrap()
    }

    #[test]
    fn linear_update_by_hand() {
        let mut kf = cv_linear();
        kf.update_filter(1.0, &DVector::zeros(0), &DVector::from_vec(vec![1.05]))
            .unwrap();
        // P⁻ = [2.01 1; 1 1.01], S = 2.11, K = [2.01, 1] / 2.11
        let k0 = 2.01 / 2.11;
        let k1 = 1.0 / 2.11;
        let x = kf.get_estimate();
        assert_approx_eq!(x[0], 1.0 + k0 * 0.05, 1e-12);
        assert_approx_eq!(x[1], 1.0 + k1 * 0.05, 1e-12);
        let p = kf.get_certainty();
        assert_approx_eq!(p[(0, 0)], 2.01 - k0 * 2.01, 1e-12);
        assert_approx_eq!(p[(0, 1)], 1.0 - k0 * 1.0, 1e-12);
        assert_approx_eq!(p[(1, 1)], 1.01 - k1 * 1.0, 1e-12);
    }

    #[test]
    fn linear_with_control_input() {
        let mut kf = LinearKalmanFilter::new(
            DMatrix::identity(1, 1),
            DMatrix::from_element(1, 1, 2.0),
            DMatrix::identity(1, 1),
            DMatrix::from_element(1, 1, 0.0),
            DMatrix::from_element(1, 1, 1.0),
            InitialEstimate::new(0.0, DVector::from_vec(vec![0.0]), DMatrix::from_element(1, 1, 1.0)),
            HistoryRetention::Full,
        )
        .unwrap();
        let prediction = kf.predict(1.0, &DVector::from_vec(vec![0.5])).unwrap();
        assert_eq!(prediction.state[0], 1.0);
        assert!(kf.predict(1.0, &DVector::zeros(0)).is_err());
        kf.update_filter(1.0, &DVector::from_vec(vec![0.5]), &DVector::from_vec(vec![2.0]))
            .unwrap();
        assert_approx_eq!(kf.get_estimate()[0], 1.5, 1e-12);
        assert_approx_eq!(kf.get_certainty()[(0, 0)], 0.5, 1e-12);
    }

    #[test]
    fn linear_shape_checks() {
        let err = LinearKalmanFilter::new(
            DMatrix::identity(3, 3),
            DMatrix::zeros(2, 0),
            DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            DMatrix::identity(2, 2),
            DMatrix::identity(1, 1),
            InitialEstimate::new(0.0, DVector::zeros(2), DMatrix::identity(2, 2)),
            HistoryRetention::Full,
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn extended_matches_linear_for_linear_models() {
        let mut kf = cv_linear();
        let mut ekf = ExtendedKalmanFilter::new(
            |_, x: &DVector<f64>, _: &DVector<f64>| DVector::from_vec(vec![x[0] + x[1], x[1]]),
            |_, x: &DVector<f64>| DVector::from_vec(vec![x[0]]),
            |_, _: &DVector<f64>, _: &DVector<f64>| DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
            |_, _: &DVector<f64>| DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            DMatrix::identity(2, 2) * 0.01,
            DMatrix::from_element(1, 1, 0.1),
            InitialEstimate::new(0.0, DVector::from_vec(vec![0.0, 1.0]), DMatrix::identity(2, 2)),
            HistoryRetention::Full,
        )
        .unwrap();
        for k in 1..=3 {
            let z = DVector::from_vec(vec![k as f64 * 0.97]);
            kf.update_filter(k as f64, &DVector::zeros(0), &z).unwrap();
            ekf.update_filter(k as f64, &DVector::zeros(0), &z).unwrap();
        }
        assert!((kf.get_estimate() - ekf.get_estimate()).amax() < 1e-12);
        assert!((kf.get_certainty() - ekf.get_certainty()).amax() < 1e-12);
    }

    #[test]
    fn extended_range_measurement() {
        // 2-D position, range-only measurement from the origin
        let mut ekf = ExtendedKalmanFilter::new(
            |_, x: &DVector<f64>, _: &DVector<f64>| x.clone(),
            |_, x: &DVector<f64>| DVector::from_vec(vec![x.norm()]),
            |_, _: &DVector<f64>, _: &DVector<f64>| DMatrix::identity(2, 2),
            |_, x: &DVector<f64>| {
                let r = x.norm();
                DMatrix::from_row_slice(1, 2, &[x[0] / r, x[1] / r])
            },
            DMatrix::identity(2, 2) * 1e-4,
            DMatrix::from_element(1, 1, 0.01),
            InitialEstimate::new(0.0, DVector::from_vec(vec![3.0, 4.0]), DMatrix::identity(2, 2)),
            HistoryRetention::Full,
        )
        .unwrap();
        ekf.update_filter(1.0, &DVector::zeros(0), &DVector::from_vec(vec![5.5]))
            .unwrap();
        let r = ekf.get_estimate().norm();
        assert!(r > 5.0 && r < 5.5, "range estimate {r}");
    }

    #[test]
    fn extended_bad_jacobian_shape() {
        let mut ekf = ExtendedKalmanFilter::new(
            |_, x: &DVector<f64>, _: &DVector<f64>| x.clone(),
            |_, x: &DVector<f64>| DVector::from_vec(vec![x[0]]),
            |_, _: &DVector<f64>, _: &DVector<f64>| DMatrix::identity(3, 3),
            |_, _: &DVector<f64>| DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            DMatrix::identity(2, 2),
            DMatrix::identity(1, 1),
            InitialEstimate::new(0.0, DVector::zeros(2), DMatrix::identity(2, 2)),
            HistoryRetention::Full,
        )
        .unwrap();
        let err = ekf
            .update_filter(1.0, &DVector::zeros(0), &DVector::from_vec(vec![0.0]))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(ekf.state_history().is_empty());
    }
}
