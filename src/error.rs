//! Custom error types for the acquisition scheduler.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that escalate out of an acquisition. Device timeouts are deliberately
//! absent: they are handled locally by each routine's degrade policy and surface as
//! warnings in the returned dataset, never as errors.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`** / **`InvalidScan`** / **`ScanOutOfRange`**: semantic problems with
//!   the requested acquisition. These are raised before any device is moved.
//! - **`DarkReferenceAborted`**: the baseline could not be measured, so no point of the
//!   sweep would be meaningful. This is the only timeout that escalates to a full abort.
//! - **`Instrument`**: a device proxy call failed (transport problem, bad reply).
//! - **`MissingReadingField`**: a fetched reading lacked the value the routine needed.
//! - **`OperatorNotConfirmed`**: a human-action prompt ended without confirmation.
//! - **`Storage`** / **`Serialization`** / **`Io`**: persistence failures.
//! - **`ConfigLoad`**: the figment configuration could not be extracted.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Which end of the tunable device's range a setpoint violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    /// Setpoint below the lowest reachable value.
    Lower,
    /// Setpoint above the highest reachable value.
    Upper,
}

impl std::fmt::Display for RangeBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeBound::Lower => write!(f, "lower"),
            RangeBound::Upper => write!(f, "upper"),
        }
    }
}

/// Errors that abort an acquisition.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Invalid configuration or missing collaborator.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Degenerate scan plan.
    #[error("Invalid scan plan: {0}")]
    InvalidScan(String),

    /// A setpoint lies outside the tunable device's range.
    #[error("Setpoint {setpoint} violates the {bound} bound {limit} of the tunable device")]
    ScanOutOfRange {
        /// First offending setpoint
        setpoint: f64,
        /// Which end of the range it crossed
        bound: RangeBound,
        /// The range limit crossed
        limit: f64,
    },

    /// The tuning-curve baseline timed out.
    #[error("Dark reference aborted: reference device timed out after {collected} of {required} samples")]
    DarkReferenceAborted {
        /// Samples taken before the timeout
        collected: usize,
        /// Samples the baseline needed
        required: usize,
    },

    /// A device proxy call failed.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// A reading lacked the expected field.
    #[error("Reading has no {kind} field named '{field}'")]
    MissingReadingField {
        /// Field name looked up
        field: String,
        /// Expected value kind, `scalar` or `image`
        kind: &'static str,
    },

    /// A human-action prompt was not confirmed.
    #[error("Operator step not confirmed: {0}")]
    OperatorNotConfirmed(String),

    /// Writing a dataset failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON encoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration could not be extracted.
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),
}

impl DaqError {
    /// Wrap a device proxy failure, keeping the device name for the log.
    pub fn instrument(device: &str, err: anyhow::Error) -> Self {
        DaqError::Instrument(format!("{device}: {err:#}"))
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::ConfigLoad(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Instrument("camera: link down".to_string());
        assert_eq!(err.to_string(), "Instrument error: camera: link down");
    }

    #[test]
    fn test_out_of_range_names_bound() {
        let err = DaqError::ScanOutOfRange {
            setpoint: 450.0,
            bound: RangeBound::Lower,
            limit: 500.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("450"));
        assert!(msg.contains("lower bound 500"));
    }

    #[test]
    fn test_instrument_wraps_context() {
        let err = DaqError::instrument("power_meter", anyhow::anyhow!("no reply"));
        assert!(err.to_string().contains("power_meter: no reply"));
    }
}
