//! Broker connection supervisor
//!
//! One [`BrokerConnection`] per producer or consumer role. A background task
//! runs the state machine `Disconnected -> Connecting -> Connected ->
//! Disconnected`, re-declaring the role's topology on every successful
//! connect and retrying forever after a fixed delay.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use microman_config::BrokerConfig;
use microman_observability::metrics::BROKER_RECONNECTS;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::transport::{Channel, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Shut down; no further reconnects
    Closed,
}

/// Declares a role's exchanges, queues, bindings and consumers on a fresh channel
#[async_trait]
pub trait Topology: Send + Sync {
    async fn declare(&self, channel: Arc<dyn Channel>) -> BrokerResult<()>;
}

/// Timing of the supervisor
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub reconnect_delay: Duration,
    pub close_grace: Duration,
}

impl From<&BrokerConfig> for ReconnectPolicy {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay(),
            close_grace: config.close_grace(),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

struct Inner {
    role: String,
    transport: Arc<dyn Transport>,
    topology: Arc<dyn Topology>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    channel: watch::Sender<Option<Arc<dyn Channel>>>,
    attempts: AtomicU32,
    shutdown: CancellationToken,
}

/// Handle to a supervised broker connection
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

impl BrokerConnection {
    /// Spawn the supervisor; the first connect attempt starts immediately
    pub fn start(
        role: impl Into<String>,
        transport: Arc<dyn Transport>,
        topology: Arc<dyn Topology>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (channel, _) = watch::channel(None);
        let connection = Self {
            inner: Arc::new(Inner {
                role: role.into(),
                transport,
                topology,
                policy,
                state,
                channel,
                attempts: AtomicU32::new(0),
                shutdown: CancellationToken::new(),
            }),
        };

        let supervisor = connection.clone();
        tokio::spawn(async move { supervisor.supervise().await });
        connection
    }

    async fn supervise(self) {
        let inner = &self.inner;
        let role = inner.role.as_str();

        loop {
            if inner.shutdown.is_cancelled() {
                break;
            }

            inner.state.send_replace(ConnectionState::Connecting);
            debug!(role, target = %inner.transport.describe(), "Connecting to broker");

            match self.connect_once().await {
                Ok(channel) => {
                    inner.attempts.store(0, Ordering::SeqCst);
                    inner.channel.send_replace(Some(Arc::clone(&channel)));
                    inner.state.send_replace(ConnectionState::Connected);
                    info!(role, "Broker connection ready");

                    tokio::select! {
                        reason = channel.closed() => {
                            warn!(role, reason = %reason, "Broker connection lost");
                        }
                        _ = inner.shutdown.cancelled() => break,
                    }
                    inner.channel.send_replace(None);
                }
                Err(err) => {
                    warn!(role, error = %err, "Broker connection failed");
                }
            }

            inner.state.send_replace(ConnectionState::Disconnected);
            let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::counter!(BROKER_RECONNECTS, "role" => inner.role.clone()).increment(1);
            info!(
                role,
                attempt,
                delay_ms = inner.policy.reconnect_delay.as_millis() as u64,
                "Scheduling broker reconnect"
            );

            tokio::select! {
                _ = tokio::time::sleep(inner.policy.reconnect_delay) => {}
                _ = inner.shutdown.cancelled() => break,
            }
        }

        inner.channel.send_replace(None);
        inner.state.send_replace(ConnectionState::Closed);
        debug!(role, "Broker supervisor stopped");
    }

    async fn connect_once(&self) -> BrokerResult<Arc<dyn Channel>> {
        let channel = self.inner.transport.open().await?;
        if let Err(err) = self.inner.topology.declare(Arc::clone(&channel)).await {
            let _ = channel.close().await;
            return Err(err);
        }
        Ok(channel)
    }

    /// Wait until a channel with declared topology is available
    pub async fn ready(&self) -> BrokerResult<Arc<dyn Channel>> {
        let mut channel = self.inner.channel.subscribe();
        loop {
            if let Some(channel) = channel.borrow_and_update().clone() {
                return Ok(channel);
            }
            if self.inner.shutdown.is_cancelled() {
                return Err(BrokerError::Closed);
            }
            tokio::select! {
                changed = channel.changed() => changed.map_err(|_| BrokerError::Closed)?,
                _ = self.inner.shutdown.cancelled() => return Err(BrokerError::Closed),
            }
        }
    }

    /// Serialize and publish once the channel is ready; no broker confirmation
    pub async fn produce<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        persistent: bool,
    ) -> BrokerResult<()> {
        let body = serde_json::to_vec(message)?;
        let channel = self.ready().await?;
        channel.publish(exchange, routing_key, body, persistent).await
    }

    /// Close after the grace delay so in-flight publishes can flush
    pub async fn close(&self) {
        tokio::time::sleep(self.inner.policy.close_grace).await;
        self.inner.shutdown.cancel();
        if let Some(channel) = self.inner.channel.send_replace(None) {
            if let Err(err) = channel.close().await {
                debug!(role = %self.inner.role, error = %err, "Error closing broker channel");
            }
        }
        self.inner.state.send_replace(ConnectionState::Closed);
        info!(role = %self.inner.role, "Broker connection closed");
    }

    pub fn role(&self) -> &str {
        &self.inner.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Failed or lost connections since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::transport::ExchangeSpec;
    use std::sync::atomic::AtomicUsize;

    struct CountingTopology {
        declared: AtomicUsize,
    }

    #[async_trait]
    impl Topology for CountingTopology {
        async fn declare(&self, channel: Arc<dyn Channel>) -> BrokerResult<()> {
            channel.declare_exchange(&ExchangeSpec::fanout("events")).await?;
            self.declared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            reconnect_delay: Duration::from_millis(20),
            close_grace: Duration::from_millis(10),
        }
    }

    async fn wait_for(connection: &BrokerConnection, state: ConnectionState) {
        let mut rx = connection.watch_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn test_connects_and_declares_topology() {
        let broker = MemoryBroker::new();
        let topology = Arc::new(CountingTopology {
            declared: AtomicUsize::new(0),
        });
        let connection =
            BrokerConnection::start("test", Arc::new(broker.clone()), topology.clone(), fast_policy());

        connection.ready().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(topology.declared.load(Ordering::SeqCst), 1);
        assert_eq!(connection.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_outage() {
        let broker = MemoryBroker::new();
        let topology = Arc::new(CountingTopology {
            declared: AtomicUsize::new(0),
        });
        let connection =
            BrokerConnection::start("test", Arc::new(broker.clone()), topology.clone(), fast_policy());
        connection.ready().await.unwrap();

        broker.set_available(false);
        broker.disconnect_all();
        wait_for(&connection, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(connection.reconnect_attempts() >= 2);

        broker.set_available(true);
        wait_for(&connection, ConnectionState::Connected).await;
        assert_eq!(connection.reconnect_attempts(), 0);
        assert!(topology.declared.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_produce_waits_for_readiness() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let topology = Arc::new(CountingTopology {
            declared: AtomicUsize::new(0),
        });
        let connection =
            BrokerConnection::start("producer", Arc::new(broker.clone()), topology, fast_policy());

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.produce("events", "", &"hello", false).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        broker.set_available(true);
        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_close_stops_reconnecting() {
        let broker = MemoryBroker::new();
        let topology = Arc::new(CountingTopology {
            declared: AtomicUsize::new(0),
        });
        let connection =
            BrokerConnection::start("test", Arc::new(broker.clone()), topology, fast_policy());
        connection.ready().await.unwrap();

        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(connection.ready().await, Err(BrokerError::Closed)));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(broker.connection_count(), 0);
    }
}
