//! Serializable filter settings and the filter factory.
//!
//! [`FilterSettings`] captures everything about a filter that is data rather than code: the
//! variant, initial estimate, noise covariances, unscented tuning, integrator and history
//! retention. It reads and writes JSON, YAML and TOML. The models themselves are closures or
//! matrices and are passed to [`create_filter`] separately as [`FilterModels`].

use std::fmt::{self, Display};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use clap::ValueEnum;
use log::info;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{Commit, StateEstimator};
use crate::error::{FilterError, Result};
use crate::filter::{InitialEstimate, MeasurementFunction, SystemFunction};
use crate::history::HistoryRetention;
use crate::integrator::IntegratorSettings;
use crate::kalman::{
    ExtendedKalmanFilter, LinearKalmanFilter, MeasurementJacobian, SystemJacobian,
    check_linear_models, linear_models,
};
use crate::parameters::{ConstantParameterReference, CustomParameters};
use crate::unscented::{UnscentedKalmanFilter, UnscentedOptions};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Linear,
    Extended,
    #[default]
    Unscented,
}

impl Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterType::Linear => write!(f, "linear"),
            FilterType::Extended => write!(f, "extended"),
            FilterType::Unscented => write!(f, "unscented"),
        }
    }
}

/// Data side of a filter definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default)]
    pub filter_type: FilterType,
    #[serde(default)]
    pub initial_time: f64,
    pub initial_state: Vec<f64>,
    /// Row-major
    pub initial_covariance: Vec<Vec<f64>>,
    pub process_noise: Vec<Vec<f64>>,
    pub measurement_noise: Vec<Vec<f64>>,
    #[serde(default)]
    pub constant_parameter_reference: ConstantParameterReference,
    #[serde(default)]
    pub custom_parameters: CustomParameters,
    #[serde(default)]
    pub integrator: Option<IntegratorSettings>,
    #[serde(default)]
    pub history_retention: HistoryRetention,
}

impl Default for FilterSettings {
    /// One-dimensional constant-velocity tracker with a position measurement
    fn default() -> Self {
        FilterSettings {
            filter_type: FilterType::Unscented,
            initial_time: 0.0,
            initial_state: vec![0.0, 1.0],
            initial_covariance: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            process_noise: vec![vec![0.01, 0.0], vec![0.0, 0.01]],
            measurement_noise: vec![vec![0.1]],
            constant_parameter_reference: ConstantParameterReference::default(),
            custom_parameters: CustomParameters::default(),
            integrator: None,
            history_retention: HistoryRetention::Full,
        }
    }
}

/// Build a matrix from row vectors, rejecting ragged input.
pub fn matrix_from_rows(name: &str, rows: &[Vec<f64>]) -> Result<DMatrix<f64>> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, |r| r.len());
    if let Some(bad) = rows.iter().position(|r| r.len() != ncols) {
        return Err(FilterError::configuration(format!(
            "{name}: row {bad} has {} values, expected {ncols}",
            rows[bad].len()
        )));
    }
    Ok(DMatrix::from_row_iterator(
        nrows,
        ncols,
        rows.iter().flat_map(|r| r.iter().copied()),
    ))
}

/// Inverse of [`matrix_from_rows`]
pub fn to_rows(matrix: &DMatrix<f64>) -> Vec<Vec<f64>> {
    matrix
        .row_iter()
        .map(|row| row.iter().copied().collect())
        .collect()
}

impl FilterSettings {
    pub fn initial_estimate(&self) -> Result<InitialEstimate> {
        Ok(InitialEstimate::new(
            self.initial_time,
            DVector::from_vec(self.initial_state.clone()),
            matrix_from_rows("initial_covariance", &self.initial_covariance)?,
        ))
    }
    pub fn process_noise_matrix(&self) -> Result<DMatrix<f64>> {
        matrix_from_rows("process_noise", &self.process_noise)
    }
    pub fn measurement_noise_matrix(&self) -> Result<DMatrix<f64>> {
        matrix_from_rows("measurement_noise", &self.measurement_noise)
    }
    pub fn unscented_options(&self) -> UnscentedOptions {
        UnscentedOptions {
            constant_parameter_reference: self.constant_parameter_reference,
            custom_parameters: self.custom_parameters,
            integrator: self.integrator,
            history_retention: self.history_retention,
        }
    }

    /// Write the settings as pretty JSON.
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    /// Read the settings from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Write the settings as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the settings from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension(p: &Path) -> Option<String> {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// Code side of a filter definition
pub enum FilterModels {
    /// $x_k = A x_{k-1} + B u$, $z = H x$; usable by every filter type
    Linear {
        system_matrix: DMatrix<f64>,
        control_matrix: DMatrix<f64>,
        measurement_matrix: DMatrix<f64>,
    },
    /// Arbitrary models. The Jacobians are only needed by the extended filter.
    Nonlinear {
        system_function: SystemFunction,
        measurement_function: MeasurementFunction,
        system_jacobian: Option<SystemJacobian>,
        measurement_jacobian: Option<MeasurementJacobian>,
    },
}

/// Build the filter selected by `settings.filter_type`.
pub fn create_filter(
    settings: &FilterSettings,
    models: FilterModels,
) -> Result<Box<dyn StateEstimator + Send>> {
    let initial = settings.initial_estimate()?;
    let process_noise = settings.process_noise_matrix()?;
    let measurement_noise = settings.measurement_noise_matrix()?;
    if settings.filter_type != FilterType::Unscented && settings.integrator.is_some() {
        return Err(FilterError::configuration(format!(
            "the {} filter is discrete-time and cannot use an integrator",
            settings.filter_type
        )));
    }
    info!("creating {} filter", settings.filter_type);
    let filter: Box<dyn StateEstimator + Send> = match (settings.filter_type, models) {
        (
            FilterType::Linear,
            FilterModels::Linear {
                system_matrix,
                control_matrix,
                measurement_matrix,
            },
        ) => Box::new(LinearKalmanFilter::new(
            system_matrix,
            control_matrix,
            measurement_matrix,
            process_noise,
            measurement_noise,
            initial,
            settings.history_retention,
        )?),
        (FilterType::Linear, FilterModels::Nonlinear { .. }) => {
            return Err(FilterError::configuration(
                "the linear filter needs matrix models",
            ));
        }
        (
            FilterType::Extended,
            FilterModels::Linear {
                system_matrix,
                control_matrix,
                measurement_matrix,
            },
        ) => {
            check_linear_models(
                &system_matrix,
                &control_matrix,
                &measurement_matrix,
                initial.state.len(),
                measurement_noise.nrows(),
            )?;
            let (system_function, measurement_function) =
                linear_models(&system_matrix, &control_matrix, &measurement_matrix);
            let mut ekf = ExtendedKalmanFilter::from_boxed(
                system_function,
                measurement_function,
                Box::new(move |_, _, _| system_matrix.clone()),
                Box::new(move |_, _| measurement_matrix.clone()),
                process_noise,
                measurement_noise,
                initial,
                settings.history_retention,
            )?;
            ekf.base_mut().set_control_dimension(control_matrix.ncols());
            Box::new(ekf)
        }
        (
            FilterType::Extended,
            FilterModels::Nonlinear {
                system_function,
                measurement_function,
                system_jacobian: Some(system_jacobian),
                measurement_jacobian: Some(measurement_jacobian),
            },
        ) => Box::new(ExtendedKalmanFilter::from_boxed(
            system_function,
            measurement_function,
            system_jacobian,
            measurement_jacobian,
            process_noise,
            measurement_noise,
            initial,
            settings.history_retention,
        )?),
        (FilterType::Extended, FilterModels::Nonlinear { .. }) => {
            return Err(FilterError::configuration(
                "the extended filter needs system and measurement Jacobians",
            ));
        }
        (
            FilterType::Unscented,
            FilterModels::Linear {
                system_matrix,
                control_matrix,
                measurement_matrix,
            },
        ) => {
            check_linear_models(
                &system_matrix,
                &control_matrix,
                &measurement_matrix,
                initial.state.len(),
                measurement_noise.nrows(),
            )?;
            let (system_function, measurement_function) =
                linear_models(&system_matrix, &control_matrix, &measurement_matrix);
            let mut ukf = UnscentedKalmanFilter::new(
                system_function,
                measurement_function,
                process_noise,
                measurement_noise,
                initial,
                settings.unscented_options(),
            )?;
            ukf.base_mut().set_control_dimension(control_matrix.ncols());
            Box::new(ukf)
        }
        (
            FilterType::Unscented,
            FilterModels::Nonlinear {
                system_function,
                measurement_function,
                ..
            },
        ) => Box::new(UnscentedKalmanFilter::new(
            system_function,
            measurement_function,
            process_noise,
            measurement_noise,
            initial,
            settings.unscented_options(),
        )?),
    };
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_settings() -> FilterSettings {
        FilterSettings {
            constant_parameter_reference: ConstantParameterReference::Custom,
            custom_parameters: CustomParameters::new(0.5, 1.0),
            history_retention: HistoryRetention::Bounded(10),
            ..Default::default()
        }
    }

    fn cv_models() -> FilterModels {
        FilterModels::Linear {
            system_matrix: DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
            control_matrix: DMatrix::zeros(2, 0),
            measurement_matrix: DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
        }
    }

    #[test]
    fn json_roundtrip() {
        let cfg = sample_settings();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("json");
        cfg.to_json(&path).unwrap();
        let loaded = FilterSettings::from_json(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn yaml_roundtrip() {
        let cfg = sample_settings();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("yaml");
        cfg.to_yaml(&path).unwrap();
        let loaded = FilterSettings::from_yaml(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = sample_settings();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("toml");
        cfg.to_toml(&path).unwrap();
        let loaded = FilterSettings::from_toml(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn generic_dispatch_and_unsupported_extension() {
        let cfg = FilterSettings::default();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("yml");
        cfg.to_file(&path).unwrap();
        assert_eq!(FilterSettings::from_file(&path).unwrap(), cfg);
        let bad = f.path().with_extension("txt");
        let err = cfg.to_file(&bad).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn minimal_json_uses_defaults() {
        let json = r#"{
            "initial_state": [1.0],
            "initial_covariance": [[1.0]],
            "process_noise": [[0.1]],
            "measurement_noise": [[0.2]]
        }"#;
        let cfg: FilterSettings = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.filter_type, FilterType::Unscented);
        assert_eq!(
            cfg.constant_parameter_reference,
            ConstantParameterReference::WanVanDerMerwe
        );
        assert_eq!(cfg.history_retention, HistoryRetention::Full);
        assert!(cfg.integrator.is_none());
    }

    #[test]
    fn ragged_rows_rejected() {
        let err = matrix_from_rows("m", &[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert!(err.is_configuration());
        let m = matrix_from_rows("m", &[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(m[(0, 1)], 2.0);
        assert_eq!(to_rows(&m), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn factory_builds_every_variant() {
        for filter_type in [FilterType::Linear, FilterType::Extended, FilterType::Unscented] {
            let settings = FilterSettings {
                filter_type,
                ..Default::default()
            };
            let mut filter = create_filter(&settings, cv_models()).unwrap();
            filter
                .update_filter(1.0, &DVector::zeros(0), &DVector::from_vec(vec![1.05]))
                .unwrap();
            assert_eq!(filter.state_history().len(), 1);
        }
    }

    #[test]
    fn factory_rejects_models_of_the_wrong_size() {
        // 1-D settings against 2-D constant-velocity matrices
        let settings = FilterSettings {
            initial_state: vec![0.0],
            initial_covariance: vec![vec![1.0]],
            process_noise: vec![vec![0.01]],
            ..Default::default()
        };
        for filter_type in [FilterType::Linear, FilterType::Extended, FilterType::Unscented] {
            let settings = FilterSettings {
                filter_type,
                ..settings.clone()
            };
            assert!(matches!(
                create_filter(&settings, cv_models()),
                Err(FilterError::Configuration(_))
            ));
        }
    }

    #[test]
    fn factory_checks_control_length() {
        let models = || FilterModels::Linear {
            system_matrix: DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
            control_matrix: DMatrix::from_row_slice(2, 1, &[0.5, 1.0]),
            measurement_matrix: DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
        };
        for filter_type in [FilterType::Linear, FilterType::Extended, FilterType::Unscented] {
            let settings = FilterSettings {
                filter_type,
                ..Default::default()
            };
            let mut filter = create_filter(&settings, models()).unwrap();
            let z = DVector::from_vec(vec![1.0]);
            let err = filter.update_filter(1.0, &DVector::zeros(0), &z).unwrap_err();
            assert!(err.is_configuration(), "{filter_type}: {err}");
            assert!(filter.state_history().is_empty());
            filter
                .update_filter(1.0, &DVector::from_vec(vec![0.2]), &z)
                .unwrap();
            assert_eq!(filter.state_history().len(), 1);
        }
    }

    #[test]
    fn factory_rejects_bad_combinations() {
        let settings = FilterSettings {
            filter_type: FilterType::Linear,
            integrator: Some(IntegratorSettings::new(Default::default(), 0.1)),
            ..Default::default()
        };
        assert!(matches!(create_filter(&settings, cv_models()), Err(e) if e.is_configuration()));

        let nonlinear = || FilterModels::Nonlinear {
            system_function: Box::new(|_, x, _| x.clone()),
            measurement_function: Box::new(|_, x| DVector::from_vec(vec![x[0]])),
            system_jacobian: None,
            measurement_jacobian: None,
        };
        let linear = FilterSettings {
            filter_type: FilterType::Linear,
            ..Default::default()
        };
        assert!(create_filter(&linear, nonlinear()).is_err());
        let extended = FilterSettings {
            filter_type: FilterType::Extended,
            ..Default::default()
        };
        assert!(create_filter(&extended, nonlinear()).is_err());
        let unscented = FilterSettings::default();
        assert!(create_filter(&unscented, nonlinear()).is_ok());

        let custom_missing = FilterSettings {
            constant_parameter_reference: ConstantParameterReference::Custom,
            ..Default::default()
        };
        assert!(matches!(
            create_filter(&custom_missing, cv_models()),
            Err(e) if e.is_configuration()
        ));
    }
}
