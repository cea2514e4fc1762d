use thiserror::Error;

use crate::transport::ExchangeKind;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Exchange {name} already declared as {existing:?}")]
    ExchangeMismatch { name: String, existing: ExchangeKind },

    #[error("Queue {0} is locked by another connection")]
    QueueLocked(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker connection closed")]
    Closed,

    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
