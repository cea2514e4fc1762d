//! Worker process
//!
//! Consumes the work channel, dispatches each request and settles its
//! delivery: acknowledged when handled or answered with an error, requeued
//! once when auto-retry is on, dropped when unreadable.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use microman_broker::{
    ConnectionState, Delivery, DeliveryHandler, PublishProducer, Transport, WorkConsumer,
    WorkConsumerOptions,
};
use microman_config::Config;
use microman_core::WorkItem;
use microman_observability::worker_span;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::dispatcher::{Dispatcher, Outcome};
use crate::handler::PublishSink;
use crate::registry::{Result, TopicRegistry};
use crate::stats::{ConsumerStats, Settlement};

struct WorkHandler {
    dispatcher: Dispatcher,
    stats: Arc<ConsumerStats>,
    auto_retry: bool,
}

impl WorkHandler {
    async fn settle(&self, delivery: &Delivery) -> Settlement {
        let item: WorkItem = match serde_json::from_slice(&delivery.body) {
            Ok(item) => item,
            Err(err) => {
                warn!(routing_key = %delivery.routing_key, error = %err, "Dropping unreadable work message");
                if let Err(err) = delivery.nack(false).await {
                    warn!(error = %err, "Failed to nack work message");
                }
                return Settlement::Drop;
            }
        };

        let retry = self.auto_retry && !delivery.redelivered;
        let span = microman_observability::request_span(item.meta.request_id.as_deref(), item.topic());
        let outcome = self
            .dispatcher
            .process(item, !retry)
            .instrument(span)
            .await;

        let (settlement, result) = match outcome {
            Outcome::Handled => (Settlement::Ack, delivery.ack().await),
            Outcome::Failed if retry => (Settlement::Requeue, delivery.nack(true).await),
            Outcome::Failed => (Settlement::Failed, delivery.ack().await),
        };
        if let Err(err) = result {
            warn!(error = %err, settlement = settlement.as_str(), "Failed to settle work message");
        }
        settlement
    }
}

#[async_trait]
impl DeliveryHandler for WorkHandler {
    async fn handle(&self, delivery: Delivery) {
        let started = Instant::now();
        let settlement = self.settle(&delivery).await;
        self.stats.record(settlement, started.elapsed());
    }
}

/// A running worker: one work consumer and one publish producer
#[derive(Clone)]
pub struct Worker {
    id: String,
    consumer: WorkConsumer,
    publisher: PublishProducer,
    stats: Arc<ConsumerStats>,
    bindings: Vec<String>,
    shutdown: CancellationToken,
}

impl Worker {
    /// Validate the dispatch table against the configured bindings and start consuming
    pub fn start(
        transport: Arc<dyn Transport>,
        config: &Config,
        registry: TopicRegistry,
    ) -> Result<Self> {
        let bindings = registry.resolve_bindings(&config.worker.bindings)?;
        let id = format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

        let publisher = PublishProducer::start(Arc::clone(&transport), &config.broker);
        let sink: Arc<dyn PublishSink> = Arc::new(publisher.clone());
        let stats = Arc::new(ConsumerStats::new());
        let handler = Arc::new(WorkHandler {
            dispatcher: Dispatcher::new(Arc::new(registry), sink),
            stats: Arc::clone(&stats),
            auto_retry: config.worker.auto_retry,
        });

        let consumer = WorkConsumer::start(
            transport,
            &config.broker,
            WorkConsumerOptions {
                group: config.worker.group.clone(),
                bindings: bindings.clone(),
                prefetch: config.worker.prefetch,
            },
            handler,
        );

        let shutdown = CancellationToken::new();
        stats.spawn_reporter(
            id.clone(),
            config.worker.stats_interval(),
            shutdown.child_token(),
        );

        let span = worker_span(&id);
        span.in_scope(|| {
            info!(
                group = ?config.worker.group,
                bindings = ?bindings,
                "Worker started"
            )
        });

        Ok(Self {
            id,
            consumer,
            publisher,
            stats,
            bindings,
            shutdown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bindings(&self) -> &[String] {
        &self.bindings
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn state(&self) -> ConnectionState {
        self.consumer.state()
    }

    pub fn consumer(&self) -> &WorkConsumer {
        &self.consumer
    }

    /// Wait until the work queue is consumed and replies can be published
    pub async fn ready(&self) -> microman_broker::BrokerResult<()> {
        self.consumer.connection().ready().await?;
        self.publisher.connection().ready().await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        tokio::join!(self.consumer.close(), self.publisher.close());
    }
}
