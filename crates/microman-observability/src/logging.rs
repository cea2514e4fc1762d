//! Structured logging
//!
//! Installs a `tracing` subscriber with a reloadable filter.

use std::sync::Arc;

use microman_config::LoggingConfig;
use parking_lot::RwLock;
use tracing_subscriber::{
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::error::{ObservabilityError, Result};

type ReloadHandle = Handle<EnvFilter, Registry>;

/// Owns the global subscriber's filter
#[derive(Debug)]
pub struct LogManager {
    config: LoggingConfig,
    /// Active base directive, e.g. `info` or the value of `RUST_LOG`
    level: String,
    reload_handle: Arc<RwLock<ReloadHandle>>,
}

impl LogManager {
    /// Install the global subscriber.
    ///
    /// `RUST_LOG` takes precedence over the configured level. Fails when a
    /// subscriber is already installed.
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let level = std::env::var("RUST_LOG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| config.level.to_string());

        let filter = build_filter(&level, config)?;
        let (filter, reload_handle) = reload::Layer::new(filter);
        let registry = tracing_subscriber::registry().with(filter);

        let installed = if config.json {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true);
            registry.with(layer).try_init()
        } else {
            let layer = tracing_subscriber::fmt::layer().with_target(true);
            registry.with(layer).try_init()
        };
        installed.map_err(|e| ObservabilityError::init(e.to_string()))?;

        tracing::info!(
            target: "microman_observability",
            level = %level,
            json = config.json,
            "Log manager initialized"
        );

        Ok(Self {
            config: config.clone(),
            level,
            reload_handle: Arc::new(RwLock::new(reload_handle)),
        })
    }

    /// Swap the base level at runtime; per-module levels are kept
    pub fn update_level(&mut self, level: &str) -> Result<()> {
        let new_filter = build_filter(level, &self.config)?;

        self.reload_handle
            .write()
            .modify(|filter| *filter = new_filter)
            .map_err(|e| ObservabilityError::logging(format!("Failed to update log level: {}", e)))?;
        self.level = level.to_string();

        tracing::info!(target: "microman_observability", level, "Log level updated");
        Ok(())
    }

    /// Current base directive
    pub fn level(&self) -> &str {
        &self.level
    }

    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }
}

/// Base directive plus per-module overrides
pub fn build_filter(level: &str, config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(level)
        .map_err(|e| ObservabilityError::logging(format!("Invalid log level: {}", e)))?;

    let mut modules: Vec<_> = config.module_levels.iter().collect();
    modules.sort_by(|a, b| a.0.cmp(b.0));
    for (module, level) in modules {
        filter = filter.add_directive(
            format!("{}={}", module, level)
                .parse()
                .map_err(|e| ObservabilityError::logging(format!("Invalid directive: {}", e)))?,
        );
    }

    Ok(filter)
}

/// Span covering one client connection
pub fn connection_span(connection_id: &str) -> tracing::Span {
    tracing::info_span!("connection", connection_id = %connection_id)
}

/// Span covering one request, correlated by `requestId` when present
pub fn request_span(request_id: Option<&str>, topic: &str) -> tracing::Span {
    match request_id {
        Some(request_id) => tracing::info_span!("request", request_id = %request_id, topic = %topic),
        None => tracing::info_span!("request", topic = %topic),
    }
}

/// Span covering a worker's consume loop
pub fn worker_span(worker_id: &str) -> tracing::Span {
    tracing::info_span!("worker", worker_id = %worker_id)
}
