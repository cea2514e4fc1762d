//! Broker transport seam
//!
//! A [`Transport`] opens channels; a [`Channel`] is the small subset of
//! AMQP 0-9-1 the gateway and workers rely on: topic and fanout exchanges,
//! named or exclusive queues, bindings, prefetch, publish, consume and
//! explicit acknowledgement.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::BrokerResult;

/// Exchange routing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route by binding pattern with `*` and `#` wildcards
    Topic,
    /// Copy every message to every bound queue
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    /// `None` lets the broker generate a name
    pub name: Option<String>,
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it
    pub exclusive: bool,
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    /// Durable queue shared by every consumer that declares the same name
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            durable: true,
            exclusive: false,
            message_ttl: None,
        }
    }

    /// Anonymous queue private to one connection
    pub fn exclusive() -> Self {
        Self {
            name: None,
            durable: false,
            exclusive: true,
            message_ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }
}

/// Settles one delivery
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// A message handed to a consumer; it must be acked or nacked exactly once
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    /// The broker delivered this message before and it was not acknowledged
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.body.len())
            .finish()
    }
}

/// Deliveries of one consumer; ends when the channel goes away
pub type DeliveryStream = BoxStream<'static, Delivery>;

#[async_trait]
pub trait Channel: Send + Sync {
    /// Idempotent; fails if the name exists with another kind
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()>;

    /// Idempotent; returns the queue name, generated when the spec has none
    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<String>;

    /// Idempotent; binding the same pattern twice leaves one binding
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    /// Limit on unacknowledged deliveries for consumers started afterwards
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    /// Publish without waiting for a broker confirmation
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        persistent: bool,
    ) -> BrokerResult<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    /// Resolves with a reason once the channel or its connection fails
    async fn closed(&self) -> String;

    async fn close(&self) -> BrokerResult<()>;
}

/// Opens broker channels
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> BrokerResult<Arc<dyn Channel>>;

    /// Human readable target for logs
    fn describe(&self) -> String;
}

/// Callback for deliveries of a consumer
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}
