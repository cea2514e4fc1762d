//! Handler contract
//!
//! A handler receives a [`HandlerContext`] holding the request and the
//! bound `reply`/`broadcast` functions that publish on the publish channel.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use microman_broker::{BrokerError, BrokerResult, PublishProducer};
use microman_core::{Message, Meta, PublishEnvelope, Session};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub type HandlerResult = Result<(), HandlerError>;

/// Errors raised by topic handlers; the `Display` text reaches the client
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Message(String),

    #[error("Topic {0} requires a session")]
    SessionRequired(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to publish: {0}")]
    Publish(#[from] BrokerError),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Message(message.into())
    }
}

/// Where replies and broadcasts are published
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(&self, envelope: PublishEnvelope) -> BrokerResult<()>;
}

#[async_trait]
impl PublishSink for PublishProducer {
    async fn publish(&self, envelope: PublishEnvelope) -> BrokerResult<()> {
        self.produce(&envelope).await
    }
}

/// Business logic bound to one topic
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> TopicHandler for F
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext) -> HandlerResult {
        (self)(ctx).await
    }
}

/// Everything a handler sees of one request
#[derive(Clone)]
pub struct HandlerContext {
    pub message: Message,
    pub meta: Meta,
    pub session: Option<Session>,
    publisher: Arc<dyn PublishSink>,
}

impl HandlerContext {
    pub fn new(
        message: Message,
        meta: Meta,
        session: Option<Session>,
        publisher: Arc<dyn PublishSink>,
    ) -> Self {
        Self {
            message,
            meta,
            session,
            publisher,
        }
    }

    pub fn topic(&self) -> &str {
        &self.message.topic
    }

    pub fn payload(&self) -> &Value {
        &self.message.payload
    }

    /// Deserialize the payload into a typed request
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.message.payload.clone())
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))
    }

    /// The attached session or a session-required error naming this topic
    pub fn require_session(&self) -> Result<&Session, HandlerError> {
        self.session
            .as_ref()
            .filter(|session| session.is_valid())
            .ok_or_else(|| HandlerError::SessionRequired(self.message.topic.clone()))
    }

    /// Reply to the originating connection with the request's meta
    pub async fn reply(&self, topic: impl Into<String>, payload: Value) -> HandlerResult {
        self.reply_with(topic, payload, self.meta.clone(), None).await
    }

    /// Reply with explicit meta, optionally attaching a session to the connection
    pub async fn reply_with(
        &self,
        topic: impl Into<String>,
        payload: Value,
        meta: Meta,
        session: Option<Session>,
    ) -> HandlerResult {
        self.publisher
            .publish(PublishEnvelope::reply(topic, payload, meta, session))
            .await?;
        Ok(())
    }

    /// Broadcast to every connection whose session belongs to `target`
    pub async fn broadcast(
        &self,
        target: impl Into<String>,
        topic: impl Into<String>,
        payload: Value,
    ) -> HandlerResult {
        self.broadcast_with(target, topic, payload, self.meta.clone())
            .await
    }

    pub async fn broadcast_with(
        &self,
        target: impl Into<String>,
        topic: impl Into<String>,
        payload: Value,
        meta: Meta,
    ) -> HandlerResult {
        self.publisher
            .publish(PublishEnvelope::broadcast(target, topic, payload, meta))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("message", &self.message)
            .field("meta", &self.meta)
            .field("session", &self.session)
            .finish()
    }
}
