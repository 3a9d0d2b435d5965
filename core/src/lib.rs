//! Recursive nonlinear state estimation toolbox
//!
//! This crate provides recursive Bayesian estimators that maintain a running best estimate of a
//! dynamic system's state and its uncertainty from noisy, time-ordered measurements. The centre of
//! the crate is the sigma-point (unscented) Kalman filter in [`unscented`]; linear and extended
//! Kalman filters in [`kalman`] share the same contract and filter base.
//!
//! Primarily built off of [`nalgebra`](https://crates.io/crates/nalgebra) for the linear algebra.
//! States are `DVector<f64>` and covariances `DMatrix<f64>`; dimensions are fixed at construction.
//!
//! # Filter contract
//!
//! Every filter implements [`StateEstimator`], which splits one update into a pure `predict`
//! step producing the a-priori estimate and a pure `correct` step producing the a-posteriori
//! estimate. Only `accept` mutates the filter, so an [`StateEstimator::update_filter`] call that
//! fails at any point leaves the previous estimate and all histories untouched.
//!
//! # Unscented update cycle
//!
//! With state dimension $n$ and measurement dimension $m$, the filter works on the augmented
//! state $x^a = [x;\ w;\ v]$ of length $L = 2n + m$ with block-diagonal covariance
//! $P^a = \mathrm{diag}(P, Q, R)$. One update:
//!
//! $$
//! \begin{aligned}
//! \chi &= \mathrm{sigma}(x^a_{k-1}, P^a_{k-1}) \\\\
//! \bar{x} &= \sum_i W^{(m)}_i \left( f(t, \chi^x_i, u) + \chi^w_i \right) \\\\
//! \bar{P} &= \sum_i W^{(c)}_i (\mathcal{X}_i - \bar{x})(\mathcal{X}_i - \bar{x})^T \\\\
//! \chi' &= \mathrm{sigma}(\bar{x}^a, \bar{P}^a), \quad \mathcal{Z}_i = h(t, \chi'^x_i) + \chi'^v_i \\\\
//! \hat{z} &= \sum_i W^{(m)}_i \mathcal{Z}_i, \quad
//! S = \sum_i W^{(c)}_i (\mathcal{Z}_i - \hat{z})(\mathcal{Z}_i - \hat{z})^T, \quad
//! C = \sum_i W^{(c)}_i (\chi'^x_i - \bar{x})(\mathcal{Z}_i - \hat{z})^T \\\\
//! K &= C S^{-1}, \quad x_k = \bar{x} + K (z - \hat{z}), \quad P_k = \bar{P} - K S K^T
//! \end{aligned}
//! $$
//!
//! # Example
//!
//! ```rust
//! use estimation::StateEstimator;
//! use estimation::filter::InitialEstimate;
//! use estimation::unscented::{UnscentedKalmanFilter, UnscentedOptions};
//! use nalgebra::{DMatrix, DVector};
//!
//! let dt = 1.0;
//! let mut ukf = UnscentedKalmanFilter::new(
//!     move |_t, x: &DVector<f64>, _u: &DVector<f64>| DVector::from_vec(vec![x[0] + x[1] * dt, x[1]]),
//!     |_t, x: &DVector<f64>| DVector::from_vec(vec![x[0]]),
//!     DMatrix::from_diagonal(&DVector::from_vec(vec![0.01, 0.01])),
//!     DMatrix::from_element(1, 1, 0.1),
//!     InitialEstimate::new(0.0, DVector::from_vec(vec![0.0, 1.0]), DMatrix::identity(2, 2)),
//!     UnscentedOptions::default(),
//! )
//! .unwrap();
//! ukf.update_filter(1.0, &DVector::zeros(0), &DVector::from_vec(vec![1.05])).unwrap();
//! assert!(ukf.get_estimate()[0] > 0.0 && ukf.get_estimate()[0] < 1.05);
//! ```
pub mod config;
pub mod error;
pub mod filter;
pub mod history;
pub mod integrator;
pub mod kalman;
pub mod linalg;
pub mod parameters;
pub mod sigma;
pub mod sim;
pub mod unscented;

use nalgebra::{DMatrix, DVector};

use log::warn;

pub use crate::error::{FilterError, Result};
use crate::filter::{Estimate, FilterBase, Prediction};
use crate::history::History;

/// Write access to a filter's estimate and archives, kept inside the crate so that
/// [`StateEstimator::update_filter`] is the only way to change them.
pub(crate) trait Commit {
    fn base_mut(&mut self) -> &mut FilterBase;
    /// Store an estimate as the new a-posteriori estimate and archive it.
    fn accept(&mut self, estimate: Estimate) {
        self.base_mut().accept(estimate);
    }
}

/// Generic recursive estimator trait that provides the predict/correct interface
/// shared by the linear, extended and unscented filters.
///
/// `predict` and `correct` are side-effect free; [`StateEstimator::update_filter`] is the
/// only mutation. The trait is implemented by the filters of this crate only.
///
/// ```rust,compile_fail
/// use estimation::StateEstimator;
/// use estimation::filter::InitialEstimate;
/// use estimation::unscented::{UnscentedKalmanFilter, UnscentedOptions};
/// use nalgebra::{DMatrix, DVector};
///
/// let mut ukf = UnscentedKalmanFilter::new(
///     |_t, x: &DVector<f64>, _u: &DVector<f64>| x.clone(),
///     |_t, x: &DVector<f64>| x.clone(),
///     DMatrix::identity(1, 1),
///     DMatrix::identity(1, 1),
///     InitialEstimate::new(0.0, DVector::zeros(1), DMatrix::identity(1, 1)),
///     UnscentedOptions::default(),
/// )
/// .unwrap();
/// // the a-posteriori estimate cannot be overwritten from outside
/// let _ = ukf.base_mut();
/// ```
#[allow(private_bounds)]
pub trait StateEstimator: Commit {
    /// A-priori estimate at `time` from the current a-posteriori estimate.
    fn predict(&self, time: f64, control: &DVector<f64>) -> Result<Prediction>;
    /// A-posteriori estimate from an a-priori estimate and a measurement.
    fn correct(&self, prediction: Prediction, measurement: &DVector<f64>) -> Result<Estimate>;
    /// Shared filter state: models, current estimate and histories
    fn base(&self) -> &FilterBase;
    /// Advance the filter by one predict/correct step.
    ///
    /// Atomic: on error nothing about the filter changes.
    fn update_filter(
        &mut self,
        time: f64,
        control: &DVector<f64>,
        measurement: &DVector<f64>,
    ) -> Result<()> {
        let estimate = self
            .predict(time, control)
            .and_then(|prediction| self.correct(prediction, measurement));
        match estimate {
            Ok(estimate) => {
                self.accept(estimate);
                Ok(())
            }
            Err(e) => {
                warn!("update at t = {time} rejected: {e}");
                Err(e)
            }
        }
    }
    /// Current a-posteriori state
    fn get_estimate(&self) -> &DVector<f64> {
        self.base().state()
    }
    /// Current a-posteriori covariance
    fn get_certainty(&self) -> &DMatrix<f64> {
        self.base().covariance()
    }
    /// Time of the current a-posteriori estimate
    fn get_current_time(&self) -> f64 {
        self.base().current_time()
    }
    fn state_history(&self) -> &History<DVector<f64>> {
        self.base().state_history()
    }
    fn covariance_history(&self) -> &History<DMatrix<f64>> {
        self.base().covariance_history()
    }
}
