//! Socket client
//!
//! Sends requests tagged with a fresh `requestId` and resolves each one
//! with the first non-ack frame carrying that id. Other frames, such as
//! broadcasts for other requests, are delivered as events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use microman_config::ClientConfig;
use microman_core::Envelope;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>;

pub struct SocketClient {
    id: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SocketClient {
    /// Connect with the default request timeout
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, &ClientConfig::default()).await
    }

    pub async fn connect_with(url: &str, config: &ClientConfig) -> Result<Self> {
        let (ws, _) = connect_async(url).await?;
        let (mut sink, mut stream) = ws.split();
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("Client send failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader_pending = Arc::clone(&pending);
        let reader_id = id.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(client = %reader_id, "Client socket error: {}", e);
                        break;
                    }
                };
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(client = %reader_id, "Unreadable frame: {}", e);
                        continue;
                    }
                };
                route_frame(&reader_id, &reader_pending, &events_tx, envelope);
            }
            // Dropping the senders fails every outstanding request.
            reader_pending.lock().clear();
        });

        Ok(Self {
            id,
            outbound,
            pending,
            events: tokio::sync::Mutex::new(events_rx),
            request_timeout: config.request_timeout(),
            reader,
            writer,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Requests still waiting for their reply
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn send_frame(&self, frame: Value) -> Result<()> {
        self.outbound
            .send(Message::Text(frame.to_string()))
            .map_err(|_| ClientError::Closed)
    }

    /// Fire and forget; any answer arrives as an event
    pub fn send(&self, topic: &str, payload: Value) -> Result<()> {
        self.send_frame(json!({ "topic": topic, "payload": payload }))
    }

    /// Send a raw text frame
    pub fn send_raw(&self, text: impl Into<String>) -> Result<()> {
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| ClientError::Closed)
    }

    /// Send a request and wait for its reply, which may be an `error` frame
    pub async fn request(&self, topic: &str, payload: Value) -> Result<Envelope> {
        self.request_with_timeout(topic, payload, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Envelope> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);
        debug!(client = %self.id, topic, request_id = %request_id, "Sending request");

        let sent = self.send_frame(json!({
            "topic": topic,
            "payload": payload,
            "meta": { "requestId": request_id },
        }));
        if let Err(err) = sent {
            self.pending.lock().remove(&request_id);
            return Err(err);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().remove(&request_id);
        match result {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                debug!(client = %self.id, request_id = %request_id, "Request timed out");
                Err(ClientError::Timeout {
                    topic: topic.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Like [`SocketClient::request`] but an `error` reply becomes [`ClientError::Remote`]
    pub async fn call(&self, topic: &str, payload: Value) -> Result<Envelope> {
        let envelope = self.request(topic, payload).await?;
        if envelope.is_error() {
            let message = envelope.error_message().unwrap_or_default().to_string();
            return Err(ClientError::Remote(message));
        }
        Ok(envelope)
    }

    /// Next frame that did not answer a pending request
    pub async fn next_event(&self) -> Option<Envelope> {
        self.events.lock().await.recv().await
    }

    /// Next event, or `None` when nothing arrives within `timeout`
    pub async fn next_event_timeout(&self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.next_event())
            .await
            .ok()
            .flatten()
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("id", &self.id)
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn route_frame(
    client: &str,
    pending: &PendingMap,
    events: &mpsc::UnboundedSender<Envelope>,
    envelope: Envelope,
) {
    if envelope.is_ack() {
        debug!(client, request_id = ?envelope.meta.request_id, ms = envelope.meta.ms, "Ack");
        return;
    }

    let waiter = envelope
        .meta
        .request_id
        .as_deref()
        .and_then(|request_id| pending.lock().remove(request_id));
    match waiter {
        Some(waiter) => {
            if let Err(envelope) = waiter.send(envelope) {
                let _ = events.send(envelope);
            }
        }
        None => {
            let _ = events.send(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microman_core::Meta;

    fn frame(topic: &str, request_id: Option<&str>) -> Envelope {
        let mut meta = Meta::default();
        meta.request_id = request_id.map(str::to_string);
        Envelope::new(topic, json!({}), meta)
    }

    #[test]
    fn test_route_frame_resolves_pending() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert("r1".to_string(), tx);

        route_frame("c", &pending, &events_tx, frame("ack", Some("r1")));
        assert_eq!(pending.lock().len(), 1);

        route_frame("c", &pending, &events_tx, frame("echo", Some("r1")));
        assert_eq!(rx.try_recv().unwrap().topic, "echo");
        assert!(pending.lock().is_empty());
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn test_route_frame_emits_events() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        route_frame("c", &pending, &events_tx, frame("news", None));
        route_frame("c", &pending, &events_tx, frame("late", Some("gone")));

        assert_eq!(events_rx.try_recv().unwrap().topic, "news");
        assert_eq!(events_rx.try_recv().unwrap().topic, "late");
    }
}
