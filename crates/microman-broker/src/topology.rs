//! Work and publish channels
//!
//! The work channel is a durable topic exchange; requests are routed by
//! their normalized topic to worker queues. The publish channel is a
//! transient fanout exchange; every gateway instance receives every reply
//! and broadcast on its own exclusive queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use microman_config::BrokerConfig;
use microman_core::{binding_key, PublishEnvelope, WorkItem};
use tracing::{debug, info};

use crate::connection::{BrokerConnection, ConnectionState, ReconnectPolicy, Topology};
use crate::error::BrokerResult;
use crate::transport::{Channel, DeliveryHandler, ExchangeSpec, QueueSpec, Transport};

fn consumer_tag(role: &str) -> String {
    format!("{}-{}", role, uuid::Uuid::new_v4())
}

struct ExchangeTopology {
    exchange: ExchangeSpec,
}

#[async_trait]
impl Topology for ExchangeTopology {
    async fn declare(&self, channel: Arc<dyn Channel>) -> BrokerResult<()> {
        channel.declare_exchange(&self.exchange).await
    }
}

/// Gateway side of the work channel
#[derive(Clone)]
pub struct WorkProducer {
    connection: BrokerConnection,
    exchange: String,
}

impl WorkProducer {
    pub fn start(transport: Arc<dyn Transport>, config: &BrokerConfig) -> Self {
        let topology = Arc::new(ExchangeTopology {
            exchange: ExchangeSpec::topic(&config.work_exchange),
        });
        Self {
            connection: BrokerConnection::start(
                "work-producer",
                transport,
                topology,
                ReconnectPolicy::from(config),
            ),
            exchange: config.work_exchange.clone(),
        }
    }

    /// Publish a request, routed by its topic with `:` normalized to `.`
    pub async fn produce(&self, item: &WorkItem) -> BrokerResult<()> {
        let routing_key = binding_key(item.topic());
        self.connection
            .produce(&self.exchange, &routing_key, item, true)
            .await
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

/// Worker side of the work channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkConsumerOptions {
    /// Competing consumer group; `None` gives this worker an exclusive queue
    pub group: Option<String>,
    /// Binding patterns, already normalized
    pub bindings: Vec<String>,
    pub prefetch: u16,
}

struct WorkConsumerTopology {
    exchange: String,
    ttl: Duration,
    options: WorkConsumerOptions,
    handler: Arc<dyn DeliveryHandler>,
}

#[async_trait]
impl Topology for WorkConsumerTopology {
    async fn declare(&self, channel: Arc<dyn Channel>) -> BrokerResult<()> {
        channel
            .declare_exchange(&ExchangeSpec::topic(&self.exchange))
            .await?;

        let spec = match &self.options.group {
            Some(group) => QueueSpec::shared(format!("{}.{}", self.exchange, group)),
            None => QueueSpec::exclusive(),
        }
        .with_ttl(self.ttl);
        let queue = channel.declare_queue(&spec).await?;

        for binding in &self.options.bindings {
            channel.bind_queue(&queue, &self.exchange, binding).await?;
        }
        channel.set_prefetch(self.options.prefetch).await?;

        let mut deliveries = channel.consume(&queue, &consumer_tag("worker")).await?;
        info!(
            queue = %queue,
            bindings = ?self.options.bindings,
            prefetch = self.options.prefetch,
            "Consuming work queue"
        );

        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler.handle(delivery).await });
            }
            debug!(queue = %queue, "Work consumer stream ended");
        });
        Ok(())
    }
}

/// Consumes the work channel, handing each delivery to a handler task.
///
/// Concurrency is bounded by the prefetch count; the handler must settle
/// every delivery.
#[derive(Clone)]
pub struct WorkConsumer {
    connection: BrokerConnection,
}

impl WorkConsumer {
    pub fn start(
        transport: Arc<dyn Transport>,
        config: &BrokerConfig,
        options: WorkConsumerOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        let topology = Arc::new(WorkConsumerTopology {
            exchange: config.work_exchange.clone(),
            ttl: config.message_ttl(),
            options,
            handler,
        });
        Self {
            connection: BrokerConnection::start(
                "work-consumer",
                transport,
                topology,
                ReconnectPolicy::from(config),
            ),
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

/// Worker side of the publish channel
#[derive(Clone)]
pub struct PublishProducer {
    connection: BrokerConnection,
    exchange: String,
}

impl PublishProducer {
    pub fn start(transport: Arc<dyn Transport>, config: &BrokerConfig) -> Self {
        let topology = Arc::new(ExchangeTopology {
            exchange: ExchangeSpec::fanout(&config.publish_exchange),
        });
        Self {
            connection: BrokerConnection::start(
                "publish-producer",
                transport,
                topology,
                ReconnectPolicy::from(config),
            ),
            exchange: config.publish_exchange.clone(),
        }
    }

    pub async fn produce(&self, envelope: &PublishEnvelope) -> BrokerResult<()> {
        self.connection
            .produce(&self.exchange, "", envelope, false)
            .await
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

struct PublishConsumerTopology {
    exchange: String,
    handler: Arc<dyn DeliveryHandler>,
}

#[async_trait]
impl Topology for PublishConsumerTopology {
    async fn declare(&self, channel: Arc<dyn Channel>) -> BrokerResult<()> {
        channel
            .declare_exchange(&ExchangeSpec::fanout(&self.exchange))
            .await?;
        let queue = channel.declare_queue(&QueueSpec::exclusive()).await?;
        channel.bind_queue(&queue, &self.exchange, "").await?;

        let mut deliveries = channel.consume(&queue, &consumer_tag("gateway")).await?;
        info!(queue = %queue, "Consuming publish queue");

        // Deliveries are handled in order, one at a time.
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                handler.handle(delivery).await;
            }
            debug!(queue = %queue, "Publish consumer stream ended");
        });
        Ok(())
    }
}

/// Gateway side of the publish channel
#[derive(Clone)]
pub struct PublishConsumer {
    connection: BrokerConnection,
}

impl PublishConsumer {
    pub fn start(
        transport: Arc<dyn Transport>,
        config: &BrokerConfig,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        let topology = Arc::new(PublishConsumerTopology {
            exchange: config.publish_exchange.clone(),
            handler,
        });
        Self {
            connection: BrokerConnection::start(
                "publish-consumer",
                transport,
                topology,
                ReconnectPolicy::from(config),
            ),
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}
