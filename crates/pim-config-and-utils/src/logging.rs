//! Logging initialization.
//!
//! Every component logs through `tracing`; the host process calls
//! [`init_logging`] once at startup to install a structured JSON subscriber.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize structured logging.
///
/// The filter comes from `RUST_LOG` when set, otherwise from `level`.
/// Calling this more than once keeps the first subscriber.
///
/// # Example
///
/// ```ignore
/// init_logging("info");
/// tracing::info!("maintenance service started");
/// ```
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(false)
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .try_init();

    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_does_not_panic() {
        init_logging("debug");
        init_logging("info");
        tracing::info!("still logging");
    }
}
