//! Gateway connection router
//!
//! Validates and admits inbound client frames, forwards them to the work
//! channel and delivers publish-channel messages to the connections this
//! instance owns.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use microman_broker::{BrokerResult, Delivery, DeliveryHandler, WorkProducer};
use microman_core::{
    Broadcast, Envelope, InboundMessage, Message, Meta, PublishEnvelope, WorkItem, BROADCAST_ALL,
};
use microman_observability::metrics::{GATEWAY_DELIVERIES, GATEWAY_REJECTED, GATEWAY_REQUESTS};
use tracing::{debug, warn};

use crate::connection::{ConnectionHandle, ConnectionRegistry};
use crate::error::InboundError;
use crate::throttle::Throttle;

/// Destination of admitted requests
#[async_trait]
pub trait WorkSink: Send + Sync {
    async fn submit(&self, item: WorkItem) -> BrokerResult<()>;
}

#[async_trait]
impl WorkSink for WorkProducer {
    async fn submit(&self, item: WorkItem) -> BrokerResult<()> {
        self.produce(&item).await
    }
}

/// Per-instance routing state shared by every connection task
pub struct ConnectionRouter {
    registry: Arc<ConnectionRegistry>,
    throttle: Arc<Throttle>,
    work: Arc<dyn WorkSink>,
}

impl ConnectionRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        throttle: Arc<Throttle>,
        work: Arc<dyn WorkSink>,
    ) -> Self {
        Self {
            registry,
            throttle,
            work,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    /// Handle one text frame from a client.
    ///
    /// Failures are answered with an `error` frame; the connection stays open.
    pub async fn handle_inbound(&self, conn: &ConnectionHandle, raw: &str) {
        if let Err(err) = self.forward(conn, raw).await {
            metrics::counter!(GATEWAY_REJECTED, "reason" => err.reason()).increment(1);
            debug!(connection_id = %conn.id, error = %err, "Rejected inbound frame");

            let mut meta = Meta::inbound(conn.sid());
            meta.request_id = InboundMessage::peek_request_id(raw);
            meta.ms = meta.elapsed_ms();
            if conn.send(Envelope::error(err.to_string(), meta)).is_err() {
                debug!(connection_id = %conn.id, "Connection gone before error reply");
            }
        }
    }

    async fn forward(&self, conn: &ConnectionHandle, raw: &str) -> Result<(), InboundError> {
        let inbound = InboundMessage::parse(raw)?;
        self.throttle.admit(&conn.id)?;

        let mut meta = Meta::inbound(conn.sid());
        meta.request_id = inbound.request_id;

        if meta.request_id.is_some() && conn.send(Envelope::ack(meta.clone())).is_err() {
            debug!(connection_id = %conn.id, "Connection gone before ack");
        }

        meta.socket_id = Some(conn.id.clone());
        meta.from = Some(inbound.topic.clone());

        let item = WorkItem {
            message: Message {
                topic: inbound.topic,
                payload: inbound.payload,
            },
            meta,
            session: conn.session(),
        };
        debug!(
            connection_id = %conn.id,
            topic = %item.topic(),
            request_id = ?item.meta.request_id,
            "Forwarding request"
        );
        self.work.submit(item).await?;
        metrics::counter!(GATEWAY_REQUESTS).increment(1);
        Ok(())
    }

    /// Handle one raw publish-channel message.
    ///
    /// Invalid messages are logged and dropped. Messages owned by another
    /// gateway instance only reach broadcast targets held here.
    pub fn handle_publish(&self, body: &[u8]) {
        let parsed = match PublishEnvelope::parse(body) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "Dropping invalid publish message");
                return;
            }
        };
        for reason in &parsed.discarded {
            warn!(reason = %reason, "Discarded part of publish message");
        }

        let PublishEnvelope {
            payload,
            meta,
            session,
            ..
        } = parsed.envelope;
        let owner = meta
            .socket_id
            .as_deref()
            .and_then(|socket_id| self.registry.get(socket_id));

        if let Some(owner) = &owner {
            if let Some(session) = session {
                debug!(connection_id = %owner.id, sid = %session.email, "Attaching session");
                owner.set_session(session);
            }
            self.throttle.release(&owner.id);
        }

        if let (Some(reply), Some(owner)) = (payload.reply, &owner) {
            let mut meta = meta.clone();
            meta.finish();
            if owner.send(Envelope::new(reply.topic, reply.payload, meta)).is_ok() {
                metrics::counter!(GATEWAY_DELIVERIES, "kind" => "reply").increment(1);
            }
        }

        if let Some(broadcasts) = payload.broadcast {
            self.deliver_broadcasts(broadcasts, &meta);
        }
    }

    fn deliver_broadcasts(&self, broadcasts: Vec<Broadcast>, meta: &Meta) {
        let mut by_target: BTreeMap<String, Vec<Broadcast>> = BTreeMap::new();
        for broadcast in broadcasts {
            by_target
                .entry(broadcast.target.clone())
                .or_default()
                .push(broadcast);
        }

        for (target, items) in by_target {
            let connections = if target == BROADCAST_ALL {
                self.registry.all()
            } else {
                self.registry.by_user(&target)
            };
            if connections.is_empty() {
                continue;
            }

            for item in items {
                let mut meta = meta.clone();
                meta.broadcast = true;
                meta.finish();
                for conn in &connections {
                    let envelope = Envelope::new(item.topic.clone(), item.payload.clone(), meta.clone());
                    if conn.send(envelope).is_ok() {
                        metrics::counter!(GATEWAY_DELIVERIES, "kind" => "broadcast").increment(1);
                    }
                }
            }
        }
    }

    /// Forget a closed connection
    pub fn disconnect(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.throttle.forget(connection_id);
        self.registry.remove(connection_id)
    }
}

/// Feeds publish-channel deliveries to the router
pub struct PublishHandler {
    router: Arc<ConnectionRouter>,
}

impl PublishHandler {
    pub fn new(router: Arc<ConnectionRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl DeliveryHandler for PublishHandler {
    async fn handle(&self, delivery: Delivery) {
        self.router.handle_publish(&delivery.body);
        if let Err(err) = delivery.ack().await {
            warn!(error = %err, "Failed to ack publish delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, SharedString, Unit};
    use microman_broker::BrokerError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use microman_config::ThrottleConfig;
    use microman_core::Session;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingSink {
        items: Mutex<Vec<WorkItem>>,
        fail: bool,
    }

    #[async_trait]
    impl WorkSink for RecordingSink {
        async fn submit(&self, item: WorkItem) -> BrokerResult<()> {
            if self.fail {
                return Err(BrokerError::Unavailable("down".to_string()));
            }
            self.items.lock().push(item);
            Ok(())
        }
    }

    fn router_with(sink: Arc<RecordingSink>, per_connection: u32) -> ConnectionRouter {
        ConnectionRouter::new(
            Arc::new(ConnectionRegistry::new(100)),
            Arc::new(Throttle::new(&ThrottleConfig {
                period_ms: 60_000,
                per_connection,
                total: 100,
            })),
            sink,
        )
    }

    fn connect(router: &ConnectionRouter, id: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let handle = ConnectionHandle::new(id.to_string(), addr, tx);
        router.registry().add(handle.clone());
        (handle, rx)
    }

    fn publish(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[tokio::test]
    async fn test_inbound_acks_and_forwards() {
        let sink = Arc::new(RecordingSink::default());
        let router = router_with(sink.clone(), 5);
        let (conn, mut rx) = connect(&router, "c1");

        router
            .handle_inbound(&conn, r#"{"topic":"echo","payload":{"v":1},"meta":{"requestId":"r1"}}"#)
            .await;

        let ack = rx.try_recv().unwrap();
        assert!(ack.is_ack());
        assert_eq!(ack.meta.request_id.as_deref(), Some("r1"));
        assert_eq!(ack.meta.sid.as_deref(), Some("public"));

        let items = sink.items.lock();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].meta.socket_id.as_deref(), Some("c1"));
        assert_eq!(items[0].meta.from.as_deref(), Some("echo"));
        assert_eq!(items[0].meta.ms, 0);
        assert!(items[0].session.is_none());
    }

    #[tokio::test]
    async fn test_no_ack_without_request_id() {
        let sink = Arc::new(RecordingSink::default());
        let router = router_with(sink.clone(), 5);
        let (conn, mut rx) = connect(&router, "c1");

        router.handle_inbound(&conn, r#"{"topic":"echo","payload":{}}"#).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(sink.items.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_frame_gets_error_with_request_id() {
        let sink = Arc::new(RecordingSink::default());
        let router = router_with(sink.clone(), 5);
        let (conn, mut rx) = connect(&router, "c1");

        router
            .handle_inbound(&conn, r#"{"payload":{},"meta":{"requestId":"r9"}}"#)
            .await;

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.error_message(), Some("Message missing topic"));
        assert_eq!(reply.meta.request_id.as_deref(), Some("r9"));
        assert!(sink.items.lock().is_empty());
    }

    #[tokio::test]
    async fn test_throttled_request_is_not_forwarded() {
        let sink = Arc::new(RecordingSink::default());
        let router = router_with(sink.clone(), 2);
        let (conn, mut rx) = connect(&router, "c1");

        for _ in 0..3 {
            router.handle_inbound(&conn, r#"{"topic":"echo","payload":{}}"#).await;
        }

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.error_message(), Some("API socket max calls exceeded"));
        assert_eq!(sink.items.lock().len(), 2);
    }

    struct CounterCell(AtomicU64);

    impl metrics::CounterFn for CounterCell {
        fn increment(&self, value: u64) {
            self.0.fetch_add(value, Ordering::Relaxed);
        }

        fn absolute(&self, value: u64) {
            self.0.fetch_max(value, Ordering::Relaxed);
        }
    }

    /// Counters summed by name, labels ignored
    #[derive(Default)]
    struct CountingRecorder {
        counters: Mutex<HashMap<String, Arc<CounterCell>>>,
    }

    impl CountingRecorder {
        fn count(&self, name: &str) -> u64 {
            self.counters
                .lock()
                .get(name)
                .map_or(0, |cell| cell.0.load(Ordering::Relaxed))
        }
    }

    impl metrics::Recorder for CountingRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            let cell = self
                .counters
                .lock()
                .entry(key.name().to_string())
                .or_insert_with(|| Arc::new(CounterCell(AtomicU64::new(0))))
                .clone();
            Counter::from_arc(cell)
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn test_only_forwarded_requests_are_counted() {
        let sink = Arc::new(RecordingSink::default());
        let router = router_with(sink.clone(), 2);
        let (conn, _rx) = connect(&router, "c1");
        let recorder = CountingRecorder::default();

        metrics::with_local_recorder(&recorder, || {
            for raw in [
                r#"{"topic":"echo","payload":{}}"#,
                "{bad",
                r#"{"topic":"echo","payload":{}}"#,
                r#"{"topic":"echo","payload":{}}"#,
            ] {
                router.handle_inbound(&conn, raw).now_or_never().unwrap();
            }
        });

        assert_eq!(sink.items.lock().len(), 2);
        assert_eq!(recorder.count(GATEWAY_REQUESTS), 2);
        assert_eq!(recorder.count(GATEWAY_REJECTED), 2);
    }

    #[tokio::test]
    async fn test_broker_failure_surfaces_as_error() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let router = router_with(sink, 5);
        let (conn, mut rx) = connect(&router, "c1");

        router.handle_inbound(&conn, r#"{"topic":"echo","payload":{}}"#).await;
        assert!(rx.try_recv().unwrap().is_error());
    }

    #[tokio::test]
    async fn test_reply_goes_to_owner_and_releases_throttle() {
        let sink = Arc::new(RecordingSink::default());
        let router = router_with(sink, 5);
        let (owner, mut owner_rx) = connect(&router, "c1");
        let (_other, mut other_rx) = connect(&router, "c2");

        router.handle_inbound(&owner, r#"{"topic":"echo","payload":{}}"#).await;
        assert_eq!(router.throttle().count("c1"), 1);

        router.handle_publish(&publish(json!({
            "topic": "publish",
            "payload": {"reply": {"topic": "echo", "payload": {"v": 1}}},
            "meta": {"socketId": "c1", "requestId": "r1", "start": 1},
            "session": {"userId": "u1", "email": "a@b.se"}
        })));

        let reply = owner_rx.try_recv().unwrap();
        assert_eq!(reply.topic, "echo");
        assert_eq!(reply.payload, json!({"v": 1}));
        assert!(reply.meta.ms > 0);
        assert!(other_rx.try_recv().is_err());
        assert_eq!(router.throttle().count("c1"), 0);
        assert_eq!(owner.sid(), "a@b.se");
    }

    #[tokio::test]
    async fn test_reply_for_unknown_socket_is_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let router = router_with(sink, 5);
        let (_conn, mut rx) = connect(&router, "c1");

        router.handle_publish(&publish(json!({
            "topic": "publish",
            "payload": {"reply": {"topic": "echo", "payload": {}}},
            "meta": {"socketId": "elsewhere"}
        })));
        router.handle_publish(b"not json");

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_targets_user_or_all() {
        let sink = Arc::new(RecordingSink::default());
        let router = router_with(sink, 5);
        let (alice, mut alice_rx) = connect(&router, "a");
        let (bob, mut bob_rx) = connect(&router, "b");
        let (_anon, mut anon_rx) = connect(&router, "x");
        alice.set_session(Session::new("u1", "alice@x.se"));
        bob.set_session(Session::new("u2", "bob@x.se"));

        router.handle_publish(&publish(json!({
            "topic": "publish",
            "payload": {"broadcast": [{"target": "u1", "topic": "todo", "payload": {"id": 1}}]},
            "meta": {"socketId": "elsewhere", "requestId": "r1"}
        })));

        let frame = alice_rx.try_recv().unwrap();
        assert_eq!(frame.topic, "todo");
        assert!(frame.meta.broadcast);
        assert_eq!(frame.meta.request_id.as_deref(), Some("r1"));
        assert!(bob_rx.try_recv().is_err());
        assert!(anon_rx.try_recv().is_err());

        router.handle_publish(&publish(json!({
            "topic": "publish",
            "payload": {"broadcast": [{"target": "ALL", "topic": "news", "payload": {}}]},
            "meta": {"socketId": "elsewhere"}
        })));
        assert_eq!(alice_rx.try_recv().unwrap().topic, "news");
        assert_eq!(bob_rx.try_recv().unwrap().topic, "news");
        assert_eq!(anon_rx.try_recv().unwrap().topic, "news");
    }

    #[tokio::test]
    async fn test_disconnect_forgets_connection() {
        let sink = Arc::new(RecordingSink::default());
        let router = router_with(sink, 5);
        let (conn, _rx) = connect(&router, "c1");
        router.handle_inbound(&conn, r#"{"topic":"echo","payload":{}}"#).await;

        assert!(router.disconnect("c1").is_some());
        assert_eq!(router.registry().count(), 0);
        assert_eq!(router.throttle().count("c1"), 0);
    }
}
