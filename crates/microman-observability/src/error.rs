//! Observability errors

/// Errors raised while installing or reconfiguring logging
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ObservabilityError {
    /// Invalid filter directive or level
    #[error("Logging error: {message}")]
    Logging {
        /// Description
        message: String,
    },

    /// A global subscriber is already installed
    #[error("Initialization error: {message}")]
    Init {
        /// Description
        message: String,
    },
}

impl ObservabilityError {
    /// Create a logging error
    pub fn logging(message: impl Into<String>) -> Self {
        Self::Logging {
            message: message.into(),
        }
    }

    /// Create an initialization error
    pub fn init(message: impl Into<String>) -> Self {
        Self::Init {
            message: message.into(),
        }
    }

    /// Error category, used as a log field
    pub fn category(&self) -> &'static str {
        match self {
            Self::Logging { .. } => "logging",
            Self::Init { .. } => "init",
        }
    }
}

/// Observability result
pub type Result<T> = std::result::Result<T, ObservabilityError>;
