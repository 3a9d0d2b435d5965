//! Simulation helpers for exercising the filters.
//!
//! Generates a one-dimensional constant-velocity target with seeded Gaussian process and
//! measurement noise, runs any [`StateEstimator`] over the resulting measurement stream and
//! collects [`EstimationResult`] rows that can be written to and read from CSV.

use std::error::Error;
use std::io;
use std::path::Path;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::StateEstimator;
use crate::config::{FilterModels, FilterSettings, FilterType, to_rows};
use crate::error::{FilterError, Result};
use crate::integrator::IntegratorSettings;
use crate::parameters::{ConstantParameterReference, CustomParameters};

/// Truth and measurement generator for $x = [p, v]$ with $p_{k+1} = p_k + v_k \Delta t$.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstantVelocityScenario {
    pub dt: f64,
    pub steps: usize,
    pub initial_position: f64,
    pub initial_velocity: f64,
    /// Standard deviation of the per-step process noise on position and velocity
    pub process_std: f64,
    /// Standard deviation of the position measurement
    pub measurement_std: f64,
    pub seed: u64,
}

impl Default for ConstantVelocityScenario {
    fn default() -> Self {
        ConstantVelocityScenario {
            dt: 1.0,
            steps: 100,
            initial_position: 0.0,
            initial_velocity: 1.0,
            process_std: 0.1,
            measurement_std: 0.5,
            seed: 42,
        }
    }
}

/// One simulated epoch
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub time: f64,
    pub truth: DVector<f64>,
    pub measurement: DVector<f64>,
}

impl ConstantVelocityScenario {
    fn validate(&self) -> Result<()> {
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return Err(FilterError::configuration(format!(
                "time step must be positive, got {}",
                self.dt
            )));
        }
        if !(self.process_std >= 0.0) || !(self.measurement_std > 0.0) {
            return Err(FilterError::configuration(
                "noise standard deviations must be non-negative (measurement strictly positive)",
            ));
        }
        Ok(())
    }

    /// Truth trajectory and noisy position measurements at `dt, 2 dt, ..., steps dt`.
    pub fn generate(&self) -> Result<Vec<Sample>> {
        self.validate()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let process = Normal::new(0.0, self.process_std)
            .map_err(|e| FilterError::configuration(e.to_string()))?;
        let measurement = Normal::new(0.0, self.measurement_std)
            .map_err(|e| FilterError::configuration(e.to_string()))?;
        let a = self.system_matrix();
        let mut x = DVector::from_vec(vec![self.initial_position, self.initial_velocity]);
        let mut samples = Vec::with_capacity(self.steps);
        for k in 1..=self.steps {
            let w = DVector::from_fn(2, |_, _| process.sample(&mut rng));
            x = &a * &x + w;
            let z = DVector::from_vec(vec![x[0] + measurement.sample(&mut rng)]);
            samples.push(Sample {
                time: k as f64 * self.dt,
                truth: x.clone(),
                measurement: z,
            });
        }
        debug!("generated {} constant-velocity samples", samples.len());
        Ok(samples)
    }

    pub fn system_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[1.0, self.dt, 0.0, 1.0])
    }

    /// Discrete-time matrix models, accepted by every filter type
    pub fn models(&self) -> FilterModels {
        FilterModels::Linear {
            system_matrix: self.system_matrix(),
            control_matrix: DMatrix::zeros(2, 0),
            measurement_matrix: DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
        }
    }

    /// Continuous-time form $\dot{p} = v$, $\dot{v} = 0$ for filters with an integrator
    pub fn derivative_models(&self) -> FilterModels {
        FilterModels::Nonlinear {
            system_function: Box::new(|_, x, _| DVector::from_vec(vec![x[1], 0.0])),
            measurement_function: Box::new(|_, x| DVector::from_vec(vec![x[0]])),
            system_jacobian: None,
            measurement_jacobian: None,
        }
    }

    /// Filter settings matched to this scenario's noise levels
    pub fn settings(
        &self,
        filter_type: FilterType,
        reference: ConstantParameterReference,
        custom_parameters: CustomParameters,
        integrator: Option<IntegratorSettings>,
    ) -> FilterSettings {
        let q = self.process_std.powi(2).max(1e-12);
        FilterSettings {
            filter_type,
            initial_time: 0.0,
            initial_state: vec![self.initial_position, self.initial_velocity],
            initial_covariance: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            process_noise: to_rows(&(DMatrix::identity(2, 2) * q)),
            measurement_noise: vec![vec![self.measurement_std.powi(2)]],
            constant_parameter_reference: reference,
            custom_parameters,
            integrator,
            ..Default::default()
        }
    }
}

/// One row of filter output
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimationResult {
    pub time: f64,
    pub true_position: f64,
    pub true_velocity: f64,
    pub measurement: f64,
    pub position: f64,
    pub velocity: f64,
    pub position_variance: f64,
    pub velocity_variance: f64,
}

impl EstimationResult {
    /// Reads a CSV file written by [`EstimationResult::to_csv`].
    pub fn from_csv<P: AsRef<Path>>(path: P) -> std::result::Result<Vec<Self>, Box<dyn Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Run `filter` over `samples` in order.
///
/// Rejected updates are logged and skipped; the filter keeps its last accepted estimate and
/// no row is produced for that epoch.
pub fn run_filter<E: StateEstimator + ?Sized>(
    filter: &mut E,
    samples: &[Sample],
) -> Vec<EstimationResult> {
    let control = DVector::zeros(0);
    let mut results = Vec::with_capacity(samples.len());
    for sample in samples {
        if let Err(e) = filter.update_filter(sample.time, &control, &sample.measurement) {
            warn!("skipping measurement at t = {}: {e}", sample.time);
            continue;
        }
        let x = filter.get_estimate();
        let p = filter.get_certainty();
        results.push(EstimationResult {
            time: sample.time,
            true_position: sample.truth[0],
            true_velocity: sample.truth[1],
            measurement: sample.measurement[0],
            position: x[0],
            velocity: x[1],
            position_variance: p[(0, 0)],
            velocity_variance: p[(1, 1)],
        });
    }
    info!(
        "filtered {} of {} measurements",
        results.len(),
        samples.len()
    );
    results
}

/// Root-mean-square position error of the estimate and of the raw measurement
pub fn position_rmse(results: &[EstimationResult]) -> (f64, f64) {
    if results.is_empty() {
        return (0.0, 0.0);
    }
    let n = results.len() as f64;
    let (estimate, measured) = results.iter().fold((0.0, 0.0), |(e, m), r| {
        (
            e + (r.position - r.true_position).powi(2),
            m + (r.measurement - r.true_position).powi(2),
        )
    });
    ((estimate / n).sqrt(), (measured / n).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::create_filter;
    use crate::integrator::IntegratorMethod;

    #[test]
    fn generation_is_reproducible() {
        let scenario = ConstantVelocityScenario::default();
        let a = scenario.generate().unwrap();
        let b = scenario.generate().unwrap();
        assert_eq!(a.len(), 100);
        assert_eq!(a, b);
        assert_eq!(a[0].time, 1.0);
        let other = ConstantVelocityScenario {
            seed: 7,
            ..Default::default()
        }
        .generate()
        .unwrap();
        assert_ne!(a[0].measurement, other[0].measurement);
    }

    #[test]
    fn invalid_scenario() {
        let scenario = ConstantVelocityScenario {
            dt: 0.0,
            ..Default::default()
        };
        assert!(scenario.generate().is_err());
    }

    #[test]
    fn filtering_beats_raw_measurements() {
        let scenario = ConstantVelocityScenario::default();
        let samples = scenario.generate().unwrap();
        for filter_type in [FilterType::Linear, FilterType::Extended, FilterType::Unscented] {
            let settings = scenario.settings(
                filter_type,
                ConstantParameterReference::WanVanDerMerwe,
                CustomParameters::default(),
                None,
            );
            let mut filter = create_filter(&settings, scenario.models()).unwrap();
            let results = run_filter(filter.as_mut(), &samples);
            assert_eq!(results.len(), samples.len());
            let (estimate, measured) = position_rmse(&results);
            assert!(estimate < measured, "{filter_type}: {estimate} >= {measured}");
        }
    }

    #[test]
    fn integrated_unscented_run() {
        let scenario = ConstantVelocityScenario {
            steps: 20,
            ..Default::default()
        };
        let samples = scenario.generate().unwrap();
        let settings = scenario.settings(
            FilterType::Unscented,
            ConstantParameterReference::LisanoBornAxelrad,
            CustomParameters::default(),
            Some(IntegratorSettings::new(IntegratorMethod::RungeKutta4, 0.25)),
        );
        let mut filter = create_filter(&settings, scenario.derivative_models()).unwrap();
        let results = run_filter(filter.as_mut(), &samples);
        assert_eq!(results.len(), 20);
        assert!(results.iter().all(|r| r.position_variance > 0.0));
    }

    #[test]
    fn csv_roundtrip() {
        let scenario = ConstantVelocityScenario {
            steps: 5,
            ..Default::default()
        };
        let samples = scenario.generate().unwrap();
        let settings = scenario.settings(
            FilterType::Linear,
            ConstantParameterReference::default(),
            CustomParameters::default(),
            None,
        );
        let mut filter = create_filter(&settings, scenario.models()).unwrap();
        let results = run_filter(filter.as_mut(), &samples);
        let temp_file = std::env::temp_dir().join("estimation_results_roundtrip.csv");
        EstimationResult::to_csv(&results, &temp_file).unwrap();
        let loaded = EstimationResult::from_csv(&temp_file).unwrap();
        assert_eq!(loaded.len(), results.len());
        for (a, b) in loaded.iter().zip(results.iter()) {
            assert!((a.position - b.position).abs() < 1e-12);
            assert!((a.velocity_variance - b.velocity_variance).abs() < 1e-12);
        }
        let _ = std::fs::remove_file(&temp_file);
    }
}
