use microman_broker::BrokerError;
use microman_core::ProtocolError;

use crate::throttle::ThrottleError;

/// Why an inbound frame was refused; the `Display` text is sent to the client
#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Throttle(#[from] ThrottleError),

    #[error("Service unavailable: {0}")]
    Broker(#[from] BrokerError),
}

impl InboundError {
    /// Metric label
    pub fn reason(&self) -> &'static str {
        match self {
            InboundError::Protocol(_) => "validation",
            InboundError::Throttle(err) => err.reason(),
            InboundError::Broker(_) => "broker",
        }
    }
}

/// Gateway-related errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
}
