//! Microman broker plumbing
//!
//! A supervised connection per role, the work and publish channels built on
//! top of it, and the transports they run over: an in-process broker and,
//! with the `amqp` feature, a real AMQP 0-9-1 broker.

pub mod connection;
pub mod error;
pub mod memory;
pub mod topology;
pub mod transport;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use connection::{BrokerConnection, ConnectionState, ReconnectPolicy, Topology};
pub use error::{BrokerError, BrokerResult};
pub use memory::MemoryBroker;
pub use topology::{
    PublishConsumer, PublishProducer, WorkConsumer, WorkConsumerOptions, WorkProducer,
};
pub use transport::{
    Acknowledge, Channel, Delivery, DeliveryHandler, DeliveryStream, ExchangeKind, ExchangeSpec,
    QueueSpec, Transport,
};
