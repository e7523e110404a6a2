//! Error types for protocol runs.
//!
//! [`ProtocolError`] is the single error type returned by the protocol
//! engine. Errors fall into three groups:
//!
//! 1. **Configuration** (`Configuration`, `AppConfig`, `FeatureNotEnabled`):
//!    detected before any hardware command is issued. Fix the configuration
//!    and rerun.
//! 2. **Hardware** (`Hardware`): a [`HardwarePort`](fluor_core::HardwarePort)
//!    call failed mid-run. The orchestrator has already attempted to close
//!    the shutter and switch the LEDs off before this reaches the caller.
//! 3. **Persistence** (`Storage`, `EventLog`): the run completed but
//!    its results could not be written.
//!
//! Lost or corrupted samples and buffer overruns are not errors; they are
//! reported as flags on the run outcome.

use fluor_core::{EventLogError, HardwareError};
use thiserror::Error;

/// Convenience alias for results using the protocol error type.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Primary error type for protocol runs.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Semantic error in the experiment or application configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The application configuration file could not be loaded.
    #[error("Failed to load configuration: {0}")]
    AppConfig(#[from] figment::Error),

    /// A hardware operation failed.
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    /// Event log misuse or persistence failure.
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// Waveform or metadata could not be written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Functionality not compiled into this build.
    #[error("Feature '{0}' is not enabled. Please rebuild with --features {0}")]
    FeatureNotEnabled(String),
}

impl ProtocolError {
    /// True for errors raised before any hardware command was issued.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProtocolError::Configuration(_)
                | ProtocolError::AppConfig(_)
                | ProtocolError::FeatureNotEnabled(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluor_core::HardwareErrorKind;

    #[test]
    fn test_hardware_error_is_transparent() {
        let err: ProtocolError =
            HardwareError::new(HardwareErrorKind::Timeout, "poll_status", "no reply").into();
        assert_eq!(
            err.to_string(),
            "Hardware timeout error during 'poll_status': no reply"
        );
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_configuration_classification() {
        assert!(ProtocolError::Configuration("bad".into()).is_configuration());
        assert!(ProtocolError::FeatureNotEnabled("storage_csv".into()).is_configuration());
        assert!(!ProtocolError::Storage("disk full".into()).is_configuration());
    }

    #[test]
    fn test_feature_not_enabled_message() {
        let err = ProtocolError::FeatureNotEnabled("storage_csv".into());
        assert!(err.to_string().contains("--features storage_csv"));
    }
}
