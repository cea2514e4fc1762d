//! AMQP 0-9-1 transport backed by `lapin`

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BrokerResult;
use crate::transport::{
    Acknowledge, Channel, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec, QueueSpec,
    Transport,
};

/// Opens one AMQP connection, with a single channel, per `open`
pub struct AmqpTransport {
    url: String,
}

impl AmqpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn open(&self) -> BrokerResult<Arc<dyn Channel>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;

        let token = CancellationToken::new();
        let reason = Arc::new(Mutex::new(String::new()));
        {
            let token = token.clone();
            let reason = Arc::clone(&reason);
            connection.on_error(move |err| {
                *reason.lock() = err.to_string();
                token.cancel();
            });
        }

        let channel = connection.create_channel().await?;
        debug!(url = %self.url, "AMQP channel opened");

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            token,
            reason,
        }))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: lapin::Channel,
    token: CancellationToken,
    reason: Arc<Mutex<String>>,
}

impl AmqpChannel {
    /// Channel level failures close the channel; surface them as a lost connection
    fn fail<T>(&self, err: lapin::Error) -> BrokerResult<T> {
        {
            let mut reason = self.reason.lock();
            if reason.is_empty() {
                *reason = err.to_string();
            }
        }
        self.token.cancel();
        Err(err.into())
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        let kind = match spec.kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            ..Default::default()
        };
        match self
            .channel
            .exchange_declare(&spec.name, kind, options, FieldTable::default())
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err),
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<String> {
        let mut arguments = FieldTable::default();
        if let Some(ttl) = spec.message_ttl {
            let millis = u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX);
            arguments.insert("x-message-ttl".into(), AMQPValue::LongUInt(millis));
        }
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.exclusive,
            ..Default::default()
        };
        let name = spec.name.as_deref().unwrap_or("");

        match self.channel.queue_declare(name, options, arguments).await {
            Ok(queue) => Ok(queue.name().as_str().to_string()),
            Err(err) => self.fail(err),
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err),
        }
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        match self.channel.basic_qos(count, BasicQosOptions::default()).await {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        persistent: bool,
    ) -> BrokerResult<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(if persistent { 2 } else { 1 });

        // The returned confirmation is not awaited.
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
        {
            Ok(_confirm) => Ok(()),
            Err(err) => self.fail(err),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => return self.fail(err),
        };

        let token = self.token.clone();
        let stream = consumer
            .take_while(move |result| {
                if let Err(err) = result {
                    warn!(error = %err, "AMQP consumer failed");
                    token.cancel();
                }
                futures_util::future::ready(result.is_ok())
            })
            .filter_map(|result| futures_util::future::ready(result.ok()))
            .map(|delivery| {
                Delivery::new(
                    delivery.data,
                    delivery.routing_key.as_str(),
                    delivery.redelivered,
                    Box::new(AmqpAcker(delivery.acker)),
                )
            });
        Ok(stream.boxed())
    }

    async fn closed(&self) -> String {
        self.token.cancelled().await;
        self.reason.lock().clone()
    }

    async fn close(&self) -> BrokerResult<()> {
        self.token.cancel();
        let _ = self.channel.close(200, "Bye").await;
        self.connection.close(200, "Bye").await?;
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        let options = BasicNackOptions {
            requeue,
            ..Default::default()
        };
        self.0.nack(options).await?;
        Ok(())
    }
}
