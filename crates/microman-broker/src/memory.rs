//! In-process broker
//!
//! Implements the [`Transport`] contract with AMQP semantics so gateways and
//! workers can run, and be tested, without an external broker. Several
//! processes' worth of gateways and workers can share one `MemoryBroker`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use microman_core::topic_matches;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{BrokerError, BrokerResult};
use crate::transport::{
    Acknowledge, Channel, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec, QueueSpec,
    Transport,
};

/// Shared in-process broker; clones refer to the same broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    available: bool,
    next_id: u64,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    consumers: HashMap<u64, ConsumerState>,
    connections: HashMap<u64, ConnectionState>,
    unacked: HashMap<u64, Unacked>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            available: true,
            next_id: 0,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            consumers: HashMap::new(),
            connections: HashMap::new(),
            unacked: HashMap::new(),
        }
    }
}

struct ExchangeState {
    kind: ExchangeKind,
    /// `(queue, binding pattern)`
    bindings: BTreeSet<(String, String)>,
}

struct QueueState {
    /// Connection owning an exclusive queue
    owner: Option<u64>,
    ttl: Option<Duration>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<u64>,
    cursor: usize,
}

#[derive(Clone)]
struct StoredMessage {
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct ConsumerState {
    queue: String,
    connection: u64,
    /// Zero means unlimited
    prefetch: u16,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct ConnectionState {
    prefetch: u16,
    token: CancellationToken,
    reason: Arc<Mutex<String>>,
}

struct Unacked {
    queue: String,
    consumer: u64,
    connection: u64,
    message: StoredMessage,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_connection(&self, connection: u64) -> BrokerResult<&ConnectionState> {
        self.connections
            .get(&connection)
            .ok_or_else(|| BrokerError::ChannelClosed("connection is closed".to_string()))
    }

    fn route(&mut self, exchange: &str, routing_key: &str) -> BrokerResult<Vec<String>> {
        let exchange = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        let mut queues: Vec<String> = exchange
            .bindings
            .iter()
            .filter(|(_, pattern)| match exchange.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(pattern, routing_key),
            })
            .map(|(queue, _)| queue.clone())
            .collect();
        queues.dedup();
        Ok(queues)
    }

    /// Hand ready messages to consumers with spare prefetch, round robin
    fn pump(&mut self, queue_name: &str, handle: &Weak<Mutex<BrokerState>>) {
        let now = Instant::now();
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            while queue.ready.front().is_some_and(|message| message.expired(now)) {
                queue.ready.pop_front();
            }
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&index| {
                    self.consumers
                        .get(&queue.consumers[index])
                        .is_some_and(ConsumerState::has_capacity)
                });
            let Some(index) = chosen else {
                return;
            };
            let consumer_id = queue.consumers[index];
            queue.cursor = (index + 1) % count;
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            self.next_id += 1;
            let tag = self.next_id;
            let delivery = Delivery::new(
                message.body.clone(),
                message.routing_key.clone(),
                message.redelivered,
                Box::new(MemoryAcker {
                    state: handle.clone(),
                    tag,
                }),
            );

            let Some(consumer) = self.consumers.get_mut(&consumer_id) else {
                return;
            };
            if consumer.tx.send(delivery).is_err() {
                // Receiver dropped: retire the consumer and retry with the rest.
                if let Some(queue) = self.queues.get_mut(queue_name) {
                    queue.ready.push_front(message);
                }
                self.remove_consumer(consumer_id);
                continue;
            }
            consumer.in_flight += 1;
            let connection = consumer.connection;
            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    consumer: consumer_id,
                    connection,
                    message,
                },
            );
        }
    }

    fn remove_consumer(&mut self, consumer_id: u64) {
        let Some(consumer) = self.consumers.remove(&consumer_id) else {
            return;
        };
        if let Some(queue) = self.queues.get_mut(&consumer.queue) {
            queue.consumers.retain(|id| *id != consumer_id);
            if queue.cursor >= queue.consumers.len() {
                queue.cursor = 0;
            }
        }
    }

    /// Settle a delivery; returns the queue to pump afterwards
    fn settle(&mut self, tag: u64, requeue: Option<bool>) -> BrokerResult<String> {
        let unacked = self.unacked.remove(&tag).ok_or_else(|| {
            BrokerError::ChannelClosed(format!("unknown delivery tag {}", tag))
        })?;

        if let Some(consumer) = self.consumers.get_mut(&unacked.consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        if requeue == Some(true) {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }

        Ok(unacked.queue)
    }

    /// Tear down a connection the way a broker does when its socket dies:
    /// consumers go away, unacked messages are requeued as redelivered and
    /// exclusive queues are deleted with their bindings.
    fn drop_connection(&mut self, connection: u64, reason: &str) -> Vec<String> {
        let Some(state) = self.connections.remove(&connection) else {
            return Vec::new();
        };
        *state.reason.lock() = reason.to_string();
        state.token.cancel();

        let consumer_ids: Vec<u64> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for id in consumer_ids {
            self.remove_consumer(id);
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut affected = BTreeSet::new();
        for tag in tags {
            let Some(unacked) = self.unacked.remove(&tag) else {
                continue;
            };
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                affected.insert(unacked.queue);
            }
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            self.queues.remove(name);
            affected.remove(name);
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|(queue, _)| queue != name);
            }
        }

        debug!(
            connection,
            reason,
            requeued_queues = affected.len(),
            deleted_queues = exclusive.len(),
            "Memory broker connection dropped"
        );
        affected.into_iter().collect()
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> BrokerResult<()> {
        let state = self.state.upgrade().ok_or(BrokerError::Closed)?;
        let mut guard = state.lock();
        let queue = guard.settle(self.tag, requeue)?;
        guard.pump(&queue, &self.state);
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.settle(Some(requeue))
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self) -> Weak<Mutex<BrokerState>> {
        Arc::downgrade(&self.state)
    }

    fn pump_all(&self, state: &mut BrokerState, queues: &[String]) {
        let handle = self.handle();
        for queue in queues {
            state.pump(queue, &handle);
        }
    }

    /// Simulate an outage: while unavailable, `open` fails
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
        info!(available, "Memory broker availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    /// Force-close every open connection
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        let mut affected = Vec::new();
        for id in ids {
            affected.extend(state.drop_connection(id, "connection forced"));
        }
        affected.sort();
        affected.dedup();
        self.pump_all(&mut state, &affected);
    }

    /// Messages waiting in a queue, excluding expired and unacked ones
    pub fn queue_depth(&self, queue: &str) -> usize {
        let now = Instant::now();
        let state = self.state.lock();
        state.queues.get(queue).map_or(0, |queue| {
            queue.ready.iter().filter(|message| !message.expired(now)).count()
        })
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn binding_count(&self, exchange: &str) -> usize {
        self.state
            .lock()
            .exchanges
            .get(exchange)
            .map_or(0, |exchange| exchange.bindings.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn open(&self) -> BrokerResult<Arc<dyn Channel>> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(BrokerError::Unavailable(
                "memory broker is offline".to_string(),
            ));
        }

        let connection = state.next_id();
        let token = CancellationToken::new();
        let reason = Arc::new(Mutex::new(String::new()));
        state.connections.insert(
            connection,
            ConnectionState {
                prefetch: 0,
                token: token.clone(),
                reason: Arc::clone(&reason),
            },
        );
        debug!(connection, "Memory broker connection opened");

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            connection,
            token,
            reason,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
    token: CancellationToken,
    reason: Arc<Mutex<String>>,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_connection(self.connection)?;

        match state.exchanges.get(&spec.name) {
            Some(existing) if existing.kind != spec.kind => Err(BrokerError::ExchangeMismatch {
                name: spec.name.clone(),
                existing: existing.kind,
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    spec.name.clone(),
                    ExchangeState {
                        kind: spec.kind,
                        bindings: BTreeSet::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<String> {
        let mut state = self.broker.state.lock();
        state.ensure_connection(self.connection)?;

        let name = match &spec.name {
            Some(name) => name.clone(),
            None => format!("amq.gen-{}", state.next_id()),
        };

        if let Some(existing) = state.queues.get(&name) {
            return match existing.owner {
                Some(owner) if owner != self.connection => Err(BrokerError::QueueLocked(name)),
                _ => Ok(name),
            };
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                owner: spec.exclusive.then_some(self.connection),
                ttl: spec.message_ttl,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_connection(self.connection)?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let exchange = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        exchange
            .bindings
            .insert((queue.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        let connection = state
            .connections
            .get_mut(&self.connection)
            .ok_or_else(|| BrokerError::ChannelClosed("connection is closed".to_string()))?;
        connection.prefetch = count;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        _persistent: bool,
    ) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_connection(self.connection)?;

        let queues = state.route(exchange, routing_key)?;
        if queues.is_empty() {
            debug!(exchange, routing_key, "Unroutable message dropped");
            return Ok(());
        }

        let now = Instant::now();
        for name in &queues {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(StoredMessage {
                    body: body.clone(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    expires_at: queue.ttl.map(|ttl| now + ttl),
                });
            }
        }
        self.broker.pump_all(&mut state, &queues);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state.lock();
            let prefetch = state.ensure_connection(self.connection)?.prefetch;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            }

            let id = state.next_id();
            state.consumers.insert(
                id,
                ConsumerState {
                    queue: queue.to_string(),
                    connection: self.connection,
                    prefetch,
                    in_flight: 0,
                    tx,
                },
            );
            if let Some(queue) = state.queues.get_mut(queue) {
                queue.consumers.push(id);
            }
            self.broker.pump_all(&mut state, &[queue.to_string()]);
        }
        debug!(queue, consumer_tag, "Consumer started");

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    async fn closed(&self) -> String {
        self.token.cancelled().await;
        self.reason.lock().clone()
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        let affected = state.drop_connection(self.connection, "closed by client");
        self.broker.pump_all(&mut state, &affected);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DeliveryStream;

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for delivery")
            .expect("stream ended")
    }

    async fn nothing(stream: &mut DeliveryStream) -> bool {
        tokio::time::timeout(Duration::from_millis(50), stream.next())
            .await
            .is_err()
    }

    async fn exclusive_consumer(
        broker: &MemoryBroker,
        exchange: &ExchangeSpec,
        patterns: &[&str],
    ) -> (Arc<dyn Channel>, DeliveryStream) {
        let channel = broker.open().await.unwrap();
        channel.declare_exchange(exchange).await.unwrap();
        let queue = channel.declare_queue(&QueueSpec::exclusive()).await.unwrap();
        for pattern in patterns {
            channel.bind_queue(&queue, &exchange.name, pattern).await.unwrap();
        }
        let stream = channel.consume(&queue, "test").await.unwrap();
        (channel, stream)
    }

    #[tokio::test]
    async fn test_topic_exchange_routes_by_pattern() {
        let broker = MemoryBroker::new();
        let work = ExchangeSpec::topic("work");
        let (_echo, mut echo) = exclusive_consumer(&broker, &work, &["echo.*"]).await;
        let (_all, mut all) = exclusive_consumer(&broker, &work, &["#"]).await;

        let producer = broker.open().await.unwrap();
        producer.publish("work", "echo.get", b"1".to_vec(), true).await.unwrap();
        producer.publish("work", "signup", b"2".to_vec(), true).await.unwrap();

        assert_eq!(next(&mut echo).await.routing_key, "echo.get");
        assert!(nothing(&mut echo).await);
        assert_eq!(next(&mut all).await.body, b"1");
        assert_eq!(next(&mut all).await.body, b"2");
    }

    #[tokio::test]
    async fn test_overlapping_bindings_deliver_once() {
        let broker = MemoryBroker::new();
        let work = ExchangeSpec::topic("work");
        let (_channel, mut stream) = exclusive_consumer(&broker, &work, &["echo.*", "#"]).await;

        let producer = broker.open().await.unwrap();
        producer.publish("work", "echo.get", b"x".to_vec(), true).await.unwrap();

        next(&mut stream).await;
        assert!(nothing(&mut stream).await);
    }

    #[tokio::test]
    async fn test_fanout_copies_to_every_queue() {
        let broker = MemoryBroker::new();
        let publish = ExchangeSpec::fanout("publish");
        let (_a, mut a) = exclusive_consumer(&broker, &publish, &[""]).await;
        let (_b, mut b) = exclusive_consumer(&broker, &publish, &[""]).await;

        let producer = broker.open().await.unwrap();
        producer.publish("publish", "", b"reply".to_vec(), false).await.unwrap();

        assert_eq!(next(&mut a).await.body, b"reply");
        assert_eq!(next(&mut b).await.body, b"reply");
    }

    #[tokio::test]
    async fn test_shared_queue_balances_consumers() {
        let broker = MemoryBroker::new();
        let work = ExchangeSpec::topic("work");
        let mut streams = Vec::new();
        let mut channels = Vec::new();
        for _ in 0..2 {
            let channel = broker.open().await.unwrap();
            channel.declare_exchange(&work).await.unwrap();
            let queue = channel.declare_queue(&QueueSpec::shared("work.group")).await.unwrap();
            channel.bind_queue(&queue, "work", "#").await.unwrap();
            streams.push(channel.consume(&queue, "member").await.unwrap());
            channels.push(channel);
        }
        assert_eq!(broker.consumer_count("work.group"), 2);

        for i in 0..4u8 {
            channels[0].publish("work", "echo", vec![i], true).await.unwrap();
        }

        for stream in streams.iter_mut() {
            for _ in 0..2 {
                next(stream).await.ack().await.unwrap();
            }
            assert!(nothing(stream).await);
        }
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked() {
        let broker = MemoryBroker::new();
        let channel = broker.open().await.unwrap();
        channel.declare_exchange(&ExchangeSpec::topic("work")).await.unwrap();
        let queue = channel.declare_queue(&QueueSpec::shared("q")).await.unwrap();
        channel.bind_queue(&queue, "work", "#").await.unwrap();
        channel.set_prefetch(1).await.unwrap();
        let mut stream = channel.consume(&queue, "c").await.unwrap();

        for i in 0..3u8 {
            channel.publish("work", "t", vec![i], true).await.unwrap();
        }

        let first = next(&mut stream).await;
        assert!(nothing(&mut stream).await);
        assert_eq!(broker.queue_depth("q"), 2);

        first.ack().await.unwrap();
        assert_eq!(next(&mut stream).await.body, vec![1]);
    }

    #[tokio::test]
    async fn test_nack_requeue_marks_redelivered() {
        let broker = MemoryBroker::new();
        let work = ExchangeSpec::topic("work");
        let (channel, mut stream) = exclusive_consumer(&broker, &work, &["#"]).await;
        channel.publish("work", "t", b"a".to_vec(), true).await.unwrap();

        let first = next(&mut stream).await;
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let again = next(&mut stream).await;
        assert!(again.redelivered);
        again.nack(false).await.unwrap();

        assert!(nothing(&mut stream).await);
        assert_eq!(broker.unacked_count(), 0);
        assert!(again.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_connection_redelivers_to_other_consumer() {
        let broker = MemoryBroker::new();
        let mut members = Vec::new();
        for _ in 0..2 {
            let channel = broker.open().await.unwrap();
            channel.declare_exchange(&ExchangeSpec::topic("work")).await.unwrap();
            let queue = channel.declare_queue(&QueueSpec::shared("g")).await.unwrap();
            channel.bind_queue(&queue, "work", "#").await.unwrap();
            let stream = channel.consume(&queue, "m").await.unwrap();
            members.push((channel, stream));
        }
        let (survivor, mut survivor_stream) = members.pop().unwrap();
        let (crashed, mut crashed_stream) = members.pop().unwrap();

        survivor.publish("work", "t", b"job".to_vec(), true).await.unwrap();
        let taken = next(&mut crashed_stream).await;
        assert!(!taken.redelivered);

        crashed.close().await.unwrap();
        let redelivered = next(&mut survivor_stream).await;
        assert_eq!(redelivered.body, b"job");
        assert!(redelivered.redelivered);
        assert!(crashed_stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_exclusive_queue_removed_with_connection() {
        let broker = MemoryBroker::new();
        let publish = ExchangeSpec::fanout("publish");
        let (channel, _stream) = exclusive_consumer(&broker, &publish, &[""]).await;
        assert_eq!(broker.binding_count("publish"), 1);

        broker.disconnect_all();
        assert_eq!(channel.closed().await, "connection forced");
        assert_eq!(broker.binding_count("publish"), 0);
        assert_eq!(broker.connection_count(), 0);
        assert!(channel.declare_exchange(&publish).await.is_err());
    }

    #[tokio::test]
    async fn test_bindings_are_idempotent() {
        let broker = MemoryBroker::new();
        let channel = broker.open().await.unwrap();
        channel.declare_exchange(&ExchangeSpec::topic("work")).await.unwrap();
        channel.declare_exchange(&ExchangeSpec::topic("work")).await.unwrap();
        let queue = channel.declare_queue(&QueueSpec::shared("q")).await.unwrap();
        channel.bind_queue(&queue, "work", "echo.*").await.unwrap();
        channel.bind_queue(&queue, "work", "echo.*").await.unwrap();

        assert_eq!(broker.binding_count("work"), 1);
        assert!(matches!(
            channel.declare_exchange(&ExchangeSpec::fanout("work")).await,
            Err(BrokerError::ExchangeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_message_ttl_expires_waiting_messages() {
        let broker = MemoryBroker::new();
        let channel = broker.open().await.unwrap();
        channel.declare_exchange(&ExchangeSpec::topic("work")).await.unwrap();
        let spec = QueueSpec::shared("q").with_ttl(Duration::from_millis(20));
        let queue = channel.declare_queue(&spec).await.unwrap();
        channel.bind_queue(&queue, "work", "#").await.unwrap();

        channel.publish("work", "t", b"old".to_vec(), true).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.queue_depth("q"), 0);

        let mut stream = channel.consume(&queue, "late").await.unwrap();
        assert!(nothing(&mut stream).await);
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(matches!(broker.open().await, Err(BrokerError::Unavailable(_))));

        broker.set_available(true);
        assert!(broker.open().await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.open().await.unwrap();
        assert!(matches!(
            channel.publish("missing", "t", Vec::new(), false).await,
            Err(BrokerError::UnknownExchange(_))
        ));
    }
}
