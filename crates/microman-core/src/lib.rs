//! Microman core - wire protocol shared by gateways, workers and clients
//!
//! This crate defines the `{topic, payload, meta}` envelope, the metadata
//! contract, session claims and the messages that travel over the work and
//! publish channels.

pub mod envelope;
pub mod error;
pub mod session;
pub mod topic;

pub use envelope::{
    now_millis, Broadcast, Envelope, InboundMessage, Message, Meta, ParsedPublish,
    PublishEnvelope, PublishPayload, Reply, WorkItem, ACK_TOPIC, BROADCAST_ALL, ERROR_TOPIC,
    PUBLISH_TOPIC,
};
pub use error::{ProtocolError, ProtocolResult};
pub use session::{display_sid, Session, PUBLIC_SID};
pub use topic::{binding_key, topic_matches};
