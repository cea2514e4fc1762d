//! Gateway main structure
//!
//! The WebSocket server that owns client connections and bridges them to
//! the work and publish channels.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use microman_broker::{PublishConsumer, Transport, WorkProducer};
use microman_config::Config;
use microman_core::{Envelope, Meta, PUBLIC_SID};
use microman_observability::connection_span;
use microman_observability::metrics::GATEWAY_CONNECTIONS;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::connection::{ConnectionHandle, ConnectionRegistry};
use crate::error::GatewayError;
use crate::router::{ConnectionRouter, PublishHandler};
use crate::throttle::Throttle;

/// One gateway instance: connection table, throttle and broker channels
#[derive(Clone)]
pub struct Gateway {
    router: Arc<ConnectionRouter>,
    work: WorkProducer,
    publish: PublishConsumer,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Create the per-instance state and start the broker channels
    pub fn start(transport: Arc<dyn Transport>, config: &Config) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.gateway.max_connections));
        let throttle = Arc::new(Throttle::new(&config.throttle));
        let work = WorkProducer::start(Arc::clone(&transport), &config.broker);
        let router = Arc::new(ConnectionRouter::new(
            registry,
            Arc::clone(&throttle),
            Arc::new(work.clone()),
        ));
        let publish = PublishConsumer::start(
            transport,
            &config.broker,
            Arc::new(PublishHandler::new(Arc::clone(&router))),
        );

        let shutdown = CancellationToken::new();
        throttle.spawn_reporter(shutdown.child_token());

        Self {
            router,
            work,
            publish,
            shutdown,
        }
    }

    pub fn router(&self) -> &Arc<ConnectionRouter> {
        &self.router
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.router.registry()
    }

    /// Wait until both broker channels are usable
    pub async fn ready(&self) -> Result<(), GatewayError> {
        self.work.connection().ready().await?;
        self.publish.connection().ready().await?;
        Ok(())
    }

    /// Bind the configured address and serve until cancelled
    pub async fn run(&self, config: &Config) -> Result<(), GatewayError> {
        let addr: SocketAddr = config.gateway.bind_addr().parse()?;
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`Gateway::shutdown`] is called
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let addr = listener.local_addr()?;
        info!("Gateway listening on ws://{}", addr);

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.shutdown.cancelled() => break,
            };
            debug!("New connection from {}", peer_addr);

            if self.registry().is_full() {
                warn!("Connection limit reached, rejecting {}", peer_addr);
                tokio::spawn(async move {
                    if let Err(e) = reject_connection(stream, "Server at capacity").await {
                        debug!("Failed to reject {}: {}", peer_addr, e);
                    }
                });
                continue;
            }

            let gateway = self.clone();
            let connection_id = Uuid::new_v4().to_string();
            let span = connection_span(&connection_id);
            tokio::spawn(
                async move {
                    if let Err(e) = gateway.handle_connection(stream, peer_addr, connection_id).await {
                        error!("Connection error for {}: {}", peer_addr, e);
                    }
                }
                .instrument(span),
            );
        }

        info!("Gateway on {} stopped accepting", addr);
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        connection_id: String,
    ) -> Result<(), GatewayError> {
        let ws_stream = accept_async(stream).await?;
        let (mut sender, mut receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let conn = ConnectionHandle::new(connection_id.clone(), addr, tx);
        self.registry().add(conn.clone());
        metrics::gauge!(GATEWAY_CONNECTIONS).increment(1.0);
        info!(connection_id = %connection_id, "Client connected from {}", addr);

        // Enqueueing may wait on the broker; socket I/O must not.
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let closed = self.shutdown.child_token();
        tokio::spawn(
            forward_inbound(Arc::clone(&self.router), conn.clone(), inbound_rx, closed.clone())
                .in_current_span(),
        );

        loop {
            tokio::select! {
                Some(envelope) = rx.recv() => {
                    match serde_json::to_string(&envelope) {
                        Ok(json) => {
                            if let Err(e) = sender.send(Message::Text(json)).await {
                                error!("Failed to send to {}: {}", addr, e);
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Failed to serialize frame: {}", e);
                        }
                    }
                }

                msg = receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(text).is_err() {
                                warn!(connection_id = %connection_id, "Inbound forwarder stopped");
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sender.send(Message::Pong(data)).await {
                                error!("Failed to send pong: {}", e);
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("WebSocket error on {}: {}", addr, e);
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                _ = self.shutdown.cancelled() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        closed.cancel();
        self.router.disconnect(&connection_id);
        metrics::gauge!(GATEWAY_CONNECTIONS).decrement(1.0);
        info!(connection_id = %connection_id, sid = %conn.sid(), "Client disconnected");
        Ok(())
    }

    /// Stop accepting, close client sockets and the broker channels
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        tokio::join!(self.work.close(), self.publish.close());
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("connections", &self.registry().count())
            .field("work", &self.work.connection().state())
            .field("publish", &self.publish.state())
            .finish()
    }
}

/// Hand a connection's frames to the router in arrival order.
///
/// Stops taking new frames once `closed` fires; a submit already waiting on
/// the broker is left to finish.
async fn forward_inbound(
    router: Arc<ConnectionRouter>,
    conn: ConnectionHandle,
    mut frames: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            raw = frames.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };
        router.handle_inbound(&conn, &raw).await;
    }
    debug!(connection_id = %conn.id, "Inbound forwarder finished");
}

/// Send one error frame to a socket that cannot be admitted, then close it
async fn reject_connection(stream: TcpStream, reason: &str) -> Result<(), GatewayError> {
    let ws_stream = accept_async(stream).await?;
    let (mut sender, _) = ws_stream.split();
    let frame = Envelope::error(reason, Meta::inbound(PUBLIC_SID));
    sender.send(Message::Text(serde_json::to_string(&frame)?)).await?;
    sender.close().await?;
    Ok(())
}
