//! Global subscriber installation. Kept in its own test binary so no other
//! test competes for the global dispatcher.

use fluor_daq::logging::{self, LoggingConfig, OutputFormat};
use serial_test::serial;
use tracing::Level;

#[test]
#[serial]
fn test_init_is_idempotent() {
    let config = LoggingConfig::new(Level::WARN)
        .with_format(OutputFormat::Compact)
        .with_ansi(false);
    assert!(logging::init(config.clone()).is_ok());
    assert!(logging::init(config).is_ok());
}

#[test]
#[serial]
fn test_init_after_other_format_is_ok() {
    let config = LoggingConfig::new(Level::DEBUG)
        .with_format(OutputFormat::Json)
        .with_span_events(true);
    assert!(logging::init(config).is_ok());
    tracing::debug!(check = true, "Logging initialised");
}
