//! Microman observability
//!
//! Logging setup, span helpers and metric names shared by every process.

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{ObservabilityError, Result};
pub use logging::{build_filter, connection_span, request_span, worker_span, LogManager};
pub use crate::metrics::describe_metrics;

/// Install logging and describe metrics in one step
pub fn init(config: &microman_config::LoggingConfig) -> Result<LogManager> {
    let manager = LogManager::init(config)?;
    describe_metrics();
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_spans() {
        // Spans are disabled without a subscriber; only construction is checked.
        let _ = connection_span("conn-1");
        let _ = request_span(Some("r1"), "echo.get");
        let _ = request_span(None, "echo.get");
        let _ = worker_span("worker-1");
        describe_metrics();
    }
}
