//! Connection registry
//!
//! Tracks the sockets owned by this gateway instance and the session
//! attached to each of them.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use microman_core::{display_sid, Envelope, Session};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::GatewayError;

/// Handle used to push frames to one client socket
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub addr: SocketAddr,
    sender: mpsc::UnboundedSender<Envelope>,
    session: Arc<RwLock<Option<Session>>>,
}

impl ConnectionHandle {
    pub fn new(id: String, addr: SocketAddr, sender: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            id,
            addr,
            sender,
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// Queue a frame for the socket's writer
    pub fn send(&self, envelope: Envelope) -> Result<(), GatewayError> {
        self.sender
            .send(envelope)
            .map_err(|_| GatewayError::ConnectionClosed(self.id.clone()))
    }

    pub fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    /// Attach or replace the session
    pub fn set_session(&self, session: Session) {
        *self.session.write() = Some(session);
    }

    /// Owning user of the attached session
    pub fn user_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|session| session.user_id.clone())
    }

    /// Session email or `public`
    pub fn sid(&self) -> String {
        display_sid(self.session.read().as_ref())
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Connections owned by one gateway instance
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_connections,
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.max_connections
    }

    pub fn add(&self, handle: ConnectionHandle) {
        self.connections.insert(handle.id.clone(), handle);
    }

    pub fn remove(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.connections
            .remove(connection_id)
            .map(|(_, handle)| handle)
    }

    pub fn get(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    /// Connections whose session belongs to `user_id`
    pub fn by_user(&self, user_id: &str) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .filter(|entry| entry.value().user_id().as_deref() == Some(user_id))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn all(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn list_connections(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}
