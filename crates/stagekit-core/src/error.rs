//! Error handling for StageKit
//!
//! Provides error types for all layers of the motion/planning core:
//! - Motion errors (HAL, modifier chain, device driver)
//! - Imager errors (capture collaborator)
//! - Scan errors (pipeline and planner)
//! - Configuration errors (scan and modifier configuration)
//!
//! All error types use `thiserror` for ergonomic error handling.

use crate::data::Axis;
use thiserror::Error;

/// Motion error type
///
/// Represents errors raised by the motion HAL, its modifier chain and the
/// concrete device driver underneath it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MotionError {
    /// A single move or jog was rejected because of a soft limit.
    ///
    /// For a jog trimmed down to nothing this names the first dropped axis and
    /// the end point it asked for.
    ///
    /// Non-fatal: the command thread reports it to the caller and continues.
    #[error("Axis {axis} exceeded: {value:.4} outside [{min:.4}, {max:.4}]")]
    AxisExceeded {
        /// The offending axis.
        axis: Axis,
        /// The requested value in user units.
        value: f64,
        /// Lower soft limit.
        min: f64,
        /// Upper soft limit.
        max: f64,
    },

    /// The operation is not valid in the current HAL state.
    #[error("Invalid motion state: {reason}")]
    InvalidState {
        /// Why the operation was refused.
        reason: String,
    },

    /// The device connection is unusable.
    #[error("Motion critical: {reason}")]
    MotionCritical {
        /// Description of the device failure.
        reason: String,
    },

    /// The user declined a required homing confirmation.
    #[error("Homing aborted by user")]
    HomingAborted,

    /// The command was flushed by stop/estop before it ran.
    #[error("Command cancelled before execution")]
    Cancelled,

    /// Waiting for a command completion timed out.
    #[error("Motion operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The motion worker is not running (halted or shut down).
    #[error("Motion worker is not running")]
    WorkerStopped,
}

impl MotionError {
    /// Create an invalid state error from a message
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        MotionError::InvalidState {
            reason: reason.into(),
        }
    }

    /// Create a critical device error from a message
    pub fn critical(reason: impl Into<String>) -> Self {
        MotionError::MotionCritical {
            reason: reason.into(),
        }
    }

    /// Whether this error is a per-command soft limit rejection
    pub fn is_axis_exceeded(&self) -> bool {
        matches!(self, MotionError::AxisExceeded { .. })
    }

    /// Whether the device handle must be discarded
    pub fn is_critical(&self) -> bool {
        matches!(self, MotionError::MotionCritical { .. })
    }
}

/// Imager error type
///
/// Represents failures of the external image capture collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImagerError {
    /// The imager did not deliver a frame in time.
    #[error("Image capture timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The delivered frame does not have the expected dimensions.
    #[error("Image size mismatch: expected {expected:?}, got {actual:?}")]
    SizeMismatch {
        /// Expected (width, height).
        expected: (u32, u32),
        /// Actual (width, height).
        actual: (u32, u32),
    },

    /// Any other device level failure.
    #[error("Imager error: {reason}")]
    Device {
        /// The reason reported by the imager.
        reason: String,
    },
}

/// Scan error type
///
/// Represents failures of the capture pipeline and its orchestration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// A stage produced no items for a branch, collapsing the pipeline.
    #[error("Pipeline stage '{stage}' produced no items")]
    EmptyStage {
        /// Name of the stage.
        stage: String,
    },

    /// Repeated imager timeouts exhausted the retry budget.
    #[error("Image capture failed after {attempts} attempts")]
    ImageTimeout {
        /// Number of capture attempts made.
        attempts: u32,
    },

    /// The number of captured images differs from the expected count.
    #[error("Captured {actual} images but expected {expected}")]
    CountMismatch {
        /// Images expected by the pipeline.
        expected: usize,
        /// Images actually captured.
        actual: usize,
    },

    /// The scan was stopped at a checkpoint.
    #[error("Scan stopped")]
    Stopped,

    /// The scan geometry cannot be realized.
    #[error("Degenerate scan geometry: {reason}")]
    Degenerate {
        /// Why the geometry is unusable.
        reason: String,
    },

    /// A pipeline stage needed state an earlier stage did not provide.
    #[error("Missing step state '{key}' in stage '{stage}'")]
    MissingState {
        /// Stage that needed the key.
        stage: String,
        /// The missing key.
        key: String,
    },
}

/// Configuration error type
///
/// Malformed scan or modifier configuration. Always raised before any motion.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// A field failed validation.
    #[error("Invalid setting '{key}': {reason}")]
    InvalidField {
        /// Dotted path of the field.
        key: String,
        /// Why the value is invalid.
        reason: String,
    },

    /// The document could not be parsed.
    #[error("Failed to parse configuration: {reason}")]
    Parse {
        /// Parser message.
        reason: String,
    },

    /// The file extension is not a supported format.
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
}

impl ConfigurationError {
    /// Create an invalid field error
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidField {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Main error type for StageKit
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Motion error
    #[error(transparent)]
    Motion(#[from] MotionError),

    /// Imager error
    #[error(transparent)]
    Imager(#[from] ImagerError),

    /// Scan error
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Configuration error
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Motion(MotionError::Timeout { .. })
                | Error::Imager(ImagerError::Timeout { .. })
                | Error::Scan(ScanError::ImageTimeout { .. })
        )
    }

    /// Check if this is a motion error
    pub fn is_motion_error(&self) -> bool {
        matches!(self, Error::Motion(_))
    }

    /// Check if the scan was stopped cooperatively
    pub fn is_stopped(&self) -> bool {
        matches!(self, Error::Scan(ScanError::Stopped))
    }

    /// Check if this is a configuration error
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_exceeded_display() {
        let err = MotionError::AxisExceeded {
            axis: Axis::X,
            value: 12.5,
            min: 0.0,
            max: 10.0,
        };
        assert_eq!(
            err.to_string(),
            "Axis x exceeded: 12.5000 outside [0.0000, 10.0000]"
        );
        assert!(err.is_axis_exceeded());
        assert!(!err.is_critical());
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = MotionError::critical("port closed").into();
        assert!(err.is_motion_error());

        let err: Error = ScanError::Stopped.into();
        assert!(err.is_stopped());

        let err: Error = ImagerError::Timeout { timeout_ms: 3000 }.into();
        assert!(err.is_timeout());

        let err: Error = ConfigurationError::invalid("scan.overlap", "must be < 1").into();
        assert!(err.is_configuration_error());
        assert_eq!(err.to_string(), "Invalid setting 'scan.overlap': must be < 1");
    }
}
