//! Session claims
//!
//! A session is an opaque bag of identity claims. It only becomes attached
//! to a connection through a worker reply carrying a `session` object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Display identity used for connections without a session
pub const PUBLIC_SID: &str = "public";

/// Identity claims attached to a connection after a handshake reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Owning user, also the broadcast target for this session
    #[serde(default)]
    pub user_id: String,
    /// Email address, used as the display identity (`sid`)
    #[serde(default)]
    pub email: String,
    /// Any further claims the issuing handler attached
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl Session {
    /// Create a new session
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            claims: Map::new(),
        }
    }

    /// Attach an extra claim
    pub fn with_claim(mut self, key: impl Into<String>, value: Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }

    /// A session is usable only when both `userId` and `email` are present.
    pub fn is_valid(&self) -> bool {
        !self.user_id.is_empty() && !self.email.is_empty()
    }
}

/// Display identity for an optional session: its email or `public`.
pub fn display_sid(session: Option<&Session>) -> String {
    match session {
        Some(session) if !session.email.is_empty() => session.email.clone(),
        _ => PUBLIC_SID.to_string(),
    }
}
