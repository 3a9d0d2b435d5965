//! Error taxonomy for the estimation toolbox.
//!
//! Every fallible filter operation returns [`FilterError`]. Both kinds are fatal to the
//! call that raised them: the filter performs no retry, and the previously accepted
//! estimate, covariance and histories are left exactly as they were.

use thiserror::Error;

/// Errors raised while constructing or updating a filter
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    /// Invalid or inconsistent setup: missing custom tuning values, mismatched
    /// dimensions, invalid integrator or retention settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A linear-algebra step could not be completed: a covariance that is not
    /// positive semi-definite, a singular innovation covariance, or non-finite values.
    #[error("numerical error: {0}")]
    Numerical(String),
}

impl FilterError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        FilterError::Configuration(message.into())
    }
    pub(crate) fn numerical(message: impl Into<String>) -> Self {
        FilterError::Numerical(message.into())
    }
    /// True for [`FilterError::Configuration`]
    pub fn is_configuration(&self) -> bool {
        matches!(self, FilterError::Configuration(_))
    }
    /// True for [`FilterError::Numerical`]
    pub fn is_numerical(&self) -> bool {
        matches!(self, FilterError::Numerical(_))
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, FilterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = FilterError::configuration("alpha missing");
        assert_eq!(e.to_string(), "configuration error: alpha missing");
        assert!(e.is_configuration());
        let e = FilterError::numerical("singular");
        assert_eq!(e.to_string(), "numerical error: singular");
        assert!(e.is_numerical());
    }
}
