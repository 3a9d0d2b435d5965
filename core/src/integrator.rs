//! Fixed-step numerical integrators used by the filter prediction step.
//!
//! When a filter is built with [`IntegratorSettings`], its system function is read as the
//! differential form $\dot{x} = f(t, x, u)$ and the prediction integrates it from the last
//! accepted time to the requested time. The final sub-step is shortened so the result
//! lands exactly on the target time.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegratorMethod {
    /// Forward Euler, first order
    Euler,
    /// Classical fourth-order Runge-Kutta
    #[default]
    RungeKutta4,
}

/// Stepper configuration for integrated state prediction
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegratorSettings {
    #[serde(default)]
    pub method: IntegratorMethod,
    /// Nominal step size, same units as the filter time
    pub step_size: f64,
}

impl IntegratorSettings {
    pub fn new(method: IntegratorMethod, step_size: f64) -> Self {
        IntegratorSettings { method, step_size }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.step_size > 0.0) || !self.step_size.is_finite() {
            return Err(FilterError::configuration(format!(
                "integrator step size must be positive and finite, got {}",
                self.step_size
            )));
        }
        Ok(())
    }

    /// Integrate `derivative` from `(t0, x0)` to `t1`.
    ///
    /// # Arguments
    /// * `derivative` - $\dot{x} = f(t, x)$
    /// * `t0` - start time
    /// * `x0` - state at `t0`
    /// * `t1` - end time, must not precede `t0`
    pub fn integrate<F>(&self, derivative: F, t0: f64, x0: &DVector<f64>, t1: f64) -> Result<DVector<f64>>
    where
        F: Fn(f64, &DVector<f64>) -> DVector<f64>,
    {
        self.validate()?;
        if !t0.is_finite() || !t1.is_finite() {
            return Err(FilterError::configuration("integration bounds must be finite"));
        }
        if t1 < t0 {
            return Err(FilterError::configuration(format!(
                "cannot integrate backwards from {t0} to {t1}"
            )));
        }
        // step times are t0 + k h, so the step count holds even when h is below the spacing of t
        let steps = ((t1 - t0) / self.step_size).ceil() as usize;
        let mut x = x0.clone();
        let mut t = t0;
        for k in 1..=steps {
            let next = if k == steps {
                t1
            } else {
                (t0 + k as f64 * self.step_size).min(t1)
            };
            let h = next - t;
            if h > 0.0 {
                x = self.step(&derivative, t, &x, h);
                t = next;
            }
        }
        Ok(x)
    }

    fn step<F>(&self, f: &F, t: f64, x: &DVector<f64>, h: f64) -> DVector<f64>
    where
        F: Fn(f64, &DVector<f64>) -> DVector<f64>,
    {
        match self.method {
            IntegratorMethod::Euler => x + h * f(t, x),
            IntegratorMethod::RungeKutta4 => {
                let k1 = f(t, x);
                let k2 = f(t + 0.5 * h, &(x + 0.5 * h * &k1));
                let k3 = f(t + 0.5 * h, &(x + 0.5 * h * &k2));
                let k4 = f(t + h, &(x + h * &k3));
                x + (h / 6.0) * (k1 + 2.0 * k2 + 2.0 * k3 + k4)
            }
        }
    }
}
