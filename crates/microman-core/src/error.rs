//! Protocol validation errors

use thiserror::Error;

/// Errors raised while validating messages on the wire.
///
/// The `Display` text of the inbound variants is what a client receives in
/// the `error` reply, so keep it short and user facing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Message is not an object")]
    NotAnObject,

    #[error("Message missing topic")]
    MissingTopic,

    #[error("Message missing payload")]
    MissingPayload,

    #[error("Invalid publish message: {0}")]
    InvalidPublish(String),
}

impl ProtocolError {
    /// Create an invalid publish error
    pub fn invalid_publish(message: impl Into<String>) -> Self {
        Self::InvalidPublish(message.into())
    }
}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
