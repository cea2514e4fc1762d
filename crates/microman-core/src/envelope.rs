//! Wire protocol definitions
//!
//! Every message is a `{topic, payload, meta}` envelope. Clients send bare
//! envelopes to a gateway, gateways forward [`WorkItem`]s onto the work
//! channel and workers answer with [`PublishEnvelope`]s on the publish
//! channel.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ProtocolError, ProtocolResult};
use crate::session::Session;

/// Receipt acknowledgment sent before a request is processed
pub const ACK_TOPIC: &str = "ack";
/// Topic of every error reply
pub const ERROR_TOPIC: &str = "error";
/// Topic of every message on the publish channel
pub const PUBLISH_TOPIC: &str = "publish";
/// Broadcast target reaching every connection
pub const BROADCAST_ALL: &str = "ALL";

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message metadata carried alongside every envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Client supplied correlation token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Connection that originated the request, stamped by the gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
    /// Display identity: session email or `public`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Originating topic, for tracing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Epoch milliseconds at which the gateway received the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Elapsed milliseconds, filled in when a frame is sent to the client
    #[serde(default)]
    pub ms: i64,
    /// Set on frames produced by a broadcast
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub broadcast: bool,
    /// Unknown fields are carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    /// Metadata for a frame just received by a gateway
    pub fn inbound(sid: impl Into<String>) -> Self {
        Self {
            sid: Some(sid.into()),
            from: Some("server".to_string()),
            start: Some(now_millis()),
            ..Self::default()
        }
    }

    /// Milliseconds since `start`, or zero when no start was recorded
    pub fn elapsed_ms(&self) -> i64 {
        self.start
            .map(|start| (now_millis() - start).max(0))
            .unwrap_or(0)
    }

    /// Fill in `ms` unless a duration was already recorded
    pub fn finish(&mut self) {
        if self.ms == 0 && self.start.is_some() {
            self.ms = self.elapsed_ms();
        }
    }
}

/// A client-facing `{topic, payload, meta}` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub meta: Meta,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(topic: impl Into<String>, payload: Value, meta: Meta) -> Self {
        Self {
            topic: topic.into(),
            payload,
            meta,
        }
    }

    /// Receipt acknowledgment; `payload` is always null
    pub fn ack(mut meta: Meta) -> Self {
        meta.ms = meta.elapsed_ms();
        Self::new(ACK_TOPIC, Value::Null, meta)
    }

    /// Error reply with `{message}` payload
    pub fn error(message: impl Into<String>, meta: Meta) -> Self {
        Self::new(ERROR_TOPIC, json!({ "message": message.into() }), meta)
    }

    /// Whether this frame is a receipt acknowledgment
    pub fn is_ack(&self) -> bool {
        self.topic == ACK_TOPIC
    }

    /// Whether this frame is an error reply
    pub fn is_error(&self) -> bool {
        self.topic == ERROR_TOPIC
    }

    /// Message text of an error reply
    pub fn error_message(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        self.payload.get("message").and_then(Value::as_str)
    }
}

/// A validated request received from a client
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Value,
    pub request_id: Option<String>,
}

impl InboundMessage {
    /// Parse and validate a raw client frame.
    ///
    /// The frame must be a JSON object with a non-empty string `topic` and a
    /// non-null `payload`. `meta.requestId` is optional.
    pub fn parse(raw: &str) -> ProtocolResult<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let topic = match map.remove("topic") {
            Some(Value::String(topic)) if !topic.is_empty() => topic,
            _ => return Err(ProtocolError::MissingTopic),
        };

        let payload = match map.remove("payload") {
            Some(Value::Null) | None => return Err(ProtocolError::MissingPayload),
            Some(payload) => payload,
        };

        let request_id = request_id_of(map.get("meta"));

        Ok(Self {
            topic,
            payload,
            request_id,
        })
    }

    /// Best effort `meta.requestId` of a frame that may fail validation, so
    /// the error reply can still be correlated
    pub fn peek_request_id(raw: &str) -> Option<String> {
        let value: Value = serde_json::from_str(raw).ok()?;
        request_id_of(value.get("meta"))
    }
}

fn request_id_of(meta: Option<&Value>) -> Option<String> {
    match meta?.get("requestId")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// The `{topic, payload}` part of a request as seen by workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

/// A request travelling over the work channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub message: Message,
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

impl WorkItem {
    /// Topic of the wrapped request
    pub fn topic(&self) -> &str {
        &self.message.topic
    }
}

/// Direct reply to the originating connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub topic: String,
    pub payload: Value,
}

/// Message delivered to every connection whose session matches `target`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    /// A session `userId`, or [`BROADCAST_ALL`]
    pub target: String,
    pub topic: String,
    pub payload: Value,
}

/// Payload of a publish-channel message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Reply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<Vec<Broadcast>>,
}

/// A reply or broadcast travelling over the publish channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEnvelope {
    pub topic: String,
    pub payload: PublishPayload,
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

/// Result of validating a publish-channel message.
///
/// `discarded` lists the parts that were dropped because they were
/// malformed; the envelope keeps whatever remained valid.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPublish {
    pub envelope: PublishEnvelope,
    pub discarded: Vec<String>,
}

impl PublishEnvelope {
    /// Reply to the originating connection, optionally performing a session handshake
    pub fn reply(
        topic: impl Into<String>,
        payload: Value,
        meta: Meta,
        session: Option<Session>,
    ) -> Self {
        Self {
            topic: PUBLISH_TOPIC.to_string(),
            payload: PublishPayload {
                reply: Some(Reply {
                    topic: topic.into(),
                    payload,
                }),
                broadcast: None,
            },
            meta,
            session,
        }
    }

    /// Broadcast to every connection whose session `userId` equals `target`
    pub fn broadcast(
        target: impl Into<String>,
        topic: impl Into<String>,
        payload: Value,
        meta: Meta,
    ) -> Self {
        Self {
            topic: PUBLISH_TOPIC.to_string(),
            payload: PublishPayload {
                reply: None,
                broadcast: Some(vec![Broadcast {
                    target: target.into(),
                    topic: topic.into(),
                    payload,
                }]),
            },
            meta,
            session: None,
        }
    }

    /// Connection that owns the reply
    pub fn socket_id(&self) -> Option<&str> {
        self.meta.socket_id.as_deref()
    }

    /// Parse and validate a raw publish-channel message
    pub fn parse(bytes: &[u8]) -> ProtocolResult<ParsedPublish> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validate a publish-channel message.
    ///
    /// Requires `topic == "publish"`, an object `payload` and a `meta`
    /// carrying `socketId`. An invalid reply, a broadcast list with any
    /// malformed entry, or an incomplete session is discarded; the message
    /// is rejected when neither a reply nor a broadcast survives.
    pub fn from_value(value: Value) -> ProtocolResult<ParsedPublish> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        if map.get("topic").and_then(Value::as_str) != Some(PUBLISH_TOPIC) {
            return Err(ProtocolError::invalid_publish("topic is not 'publish'"));
        }

        let meta: Meta = match map.remove("meta") {
            Some(meta @ Value::Object(_)) => serde_json::from_value(meta)
                .map_err(|e| ProtocolError::invalid_publish(format!("invalid meta: {}", e)))?,
            _ => return Err(ProtocolError::invalid_publish("meta is not an object")),
        };
        if meta.socket_id.as_deref().map_or(true, str::is_empty) {
            return Err(ProtocolError::invalid_publish("meta.socketId is missing"));
        }

        let Some(Value::Object(mut payload)) = map.remove("payload") else {
            return Err(ProtocolError::invalid_publish("payload is not an object"));
        };

        let mut discarded = Vec::new();

        let reply = match payload.remove("reply") {
            None | Some(Value::Null) => None,
            Some(reply) => match take_reply(reply) {
                Some(reply) => Some(reply),
                None => {
                    discarded.push("invalid reply payload".to_string());
                    None
                }
            },
        };

        let broadcast = match payload.remove("broadcast") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => {
                let parsed: Option<Vec<Broadcast>> = items.into_iter().map(take_broadcast).collect();
                if parsed.is_none() {
                    discarded.push("invalid broadcast payload".to_string());
                }
                parsed
            }
            Some(_) => {
                discarded.push("broadcast is not a list".to_string());
                None
            }
        };

        if reply.is_none() && broadcast.is_none() {
            return Err(ProtocolError::invalid_publish(
                "neither a valid reply nor a valid broadcast",
            ));
        }

        let session = match map.remove("session") {
            None | Some(Value::Null) => None,
            Some(session) => match serde_json::from_value::<Session>(session) {
                Ok(session) if session.is_valid() => Some(session),
                _ => {
                    discarded.push("invalid session data".to_string());
                    None
                }
            },
        };

        Ok(ParsedPublish {
            envelope: Self {
                topic: PUBLISH_TOPIC.to_string(),
                payload: PublishPayload { reply, broadcast },
                meta,
                session,
            },
            discarded,
        })
    }
}

fn non_empty_topic(map: &mut Map<String, Value>) -> Option<String> {
    match map.remove("topic") {
        Some(Value::String(topic)) if !topic.is_empty() => Some(topic),
        _ => None,
    }
}

fn present_payload(map: &mut Map<String, Value>) -> Option<Value> {
    match map.remove("payload") {
        Some(Value::Null) | None => None,
        Some(payload) => Some(payload),
    }
}

fn take_reply(value: Value) -> Option<Reply> {
    let Value::Object(mut map) = value else {
        return None;
    };
    Some(Reply {
        topic: non_empty_topic(&mut map)?,
        payload: present_payload(&mut map)?,
    })
}

fn take_broadcast(value: Value) -> Option<Broadcast> {
    let Value::Object(mut map) = value else {
        return None;
    };
    let target = match map.remove("target") {
        Some(Value::String(target)) => target,
        Some(Value::Number(target)) => target.to_string(),
        _ => String::new(),
    };
    Some(Broadcast {
        target,
        topic: non_empty_topic(&mut map)?,
        payload: present_payload(&mut map)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inbound() {
        let msg = InboundMessage::parse(
            r#"{"topic":"echo.get","payload":{"value":"ABC"},"meta":{"requestId":"r1"}}"#,
        )
        .unwrap();

        assert_eq!(msg.topic, "echo.get");
        assert_eq!(msg.payload, json!({"value": "ABC"}));
        assert_eq!(msg.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_parse_inbound_rejects_malformed() {
        assert!(matches!(
            InboundMessage::parse("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(
            InboundMessage::parse("[1,2]").unwrap_err(),
            ProtocolError::NotAnObject
        );
        assert_eq!(
            InboundMessage::parse(r#"{"payload":{}}"#).unwrap_err(),
            ProtocolError::MissingTopic
        );
        assert_eq!(
            InboundMessage::parse(r#"{"topic":"","payload":{}}"#).unwrap_err(),
            ProtocolError::MissingTopic
        );
        assert_eq!(
            InboundMessage::parse(r#"{"topic":"echo","payload":null}"#).unwrap_err(),
            ProtocolError::MissingPayload
        );
        assert_eq!(
            ProtocolError::MissingPayload.to_string(),
            "Message missing payload"
        );
    }

    #[test]
    fn test_peek_request_id() {
        assert_eq!(
            InboundMessage::peek_request_id(r#"{"topic":"x","meta":{"requestId":"r9"}}"#).as_deref(),
            Some("r9")
        );
        assert_eq!(
            InboundMessage::peek_request_id(r#"{"meta":{"requestId":42}}"#).as_deref(),
            Some("42")
        );
        assert_eq!(InboundMessage::peek_request_id("garbage"), None);
    }

    #[test]
    fn test_meta_wire_format() {
        let mut meta = Meta::inbound("public");
        meta.request_id = Some("r1".to_string());
        meta.socket_id = Some("s1".to_string());

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["socketId"], "s1");
        assert_eq!(value["sid"], "public");
        assert_eq!(value["from"], "server");
        assert_eq!(value["ms"], 0);
        assert!(value.get("broadcast").is_none());

        meta.broadcast = true;
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["broadcast"], true);
    }

    #[test]
    fn test_meta_keeps_unknown_fields() {
        let meta: Meta = serde_json::from_value(json!({"socketId": "s1", "trace": "t-9"})).unwrap();
        assert_eq!(meta.extra.get("trace"), Some(&json!("t-9")));
        assert_eq!(serde_json::to_value(&meta).unwrap()["trace"], "t-9");
    }

    #[test]
    fn test_ack_and_error_frames() {
        let ack = Envelope::ack(Meta::inbound("public"));
        assert!(ack.is_ack());
        assert_eq!(ack.payload, Value::Null);

        let error = Envelope::error("API too busy", Meta::default());
        assert_eq!(error.error_message(), Some("API too busy"));
        assert_eq!(
            serde_json::to_value(&error).unwrap()["payload"],
            json!({"message": "API too busy"})
        );
    }

    #[test]
    fn test_work_item_shape() {
        let item = WorkItem {
            message: Message {
                topic: "todo:create".to_string(),
                payload: json!({"title": "My Todo!"}),
            },
            meta: Meta::default(),
            session: Some(Session::new("u1", "a@b.se")),
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["message"]["topic"], "todo:create");
        assert_eq!(value["session"]["userId"], "u1");
    }

    fn publish_meta() -> Value {
        json!({"socketId": "s1", "requestId": "r1"})
    }

    #[test]
    fn test_publish_reply_is_parsed() {
        let mut meta = Meta::default();
        meta.socket_id = Some("s1".to_string());
        let envelope = PublishEnvelope::reply(
            "signup",
            json!({"ok": true}),
            meta,
            Some(Session::new("u1", "a@b.se")),
        );
        let bytes = serde_json::to_vec(&envelope).unwrap();

        let parsed = PublishEnvelope::parse(&bytes).unwrap();
        assert!(parsed.discarded.is_empty());
        assert_eq!(parsed.envelope, envelope);
    }

    #[test]
    fn test_publish_requires_socket_id_and_topic() {
        let missing_socket = json!({
            "topic": "publish",
            "payload": {"reply": {"topic": "echo", "payload": {}}},
            "meta": {"requestId": "r1"}
        });
        assert!(PublishEnvelope::from_value(missing_socket).is_err());

        let wrong_topic = json!({
            "topic": "echo",
            "payload": {"reply": {"topic": "echo", "payload": {}}},
            "meta": publish_meta()
        });
        assert!(PublishEnvelope::from_value(wrong_topic).is_err());

        let payload_not_object = json!({"topic": "publish", "payload": 3, "meta": publish_meta()});
        assert!(PublishEnvelope::from_value(payload_not_object).is_err());
    }

    #[test]
    fn test_publish_discards_invalid_parts() {
        let value = json!({
            "topic": "publish",
            "payload": {
                "reply": {"topic": "echo"},
                "broadcast": [{"target": "ALL", "topic": "news", "payload": {"n": 1}}]
            },
            "meta": publish_meta(),
            "session": {"userId": "u1"}
        });
        let parsed = PublishEnvelope::from_value(value).unwrap();

        assert!(parsed.envelope.payload.reply.is_none());
        assert_eq!(parsed.envelope.payload.broadcast.as_ref().unwrap().len(), 1);
        assert!(parsed.envelope.session.is_none());
        assert_eq!(parsed.discarded.len(), 2);
    }

    #[test]
    fn test_publish_rejected_when_nothing_valid_remains() {
        let value = json!({
            "topic": "publish",
            "payload": {
                "broadcast": [
                    {"target": "ALL", "topic": "news", "payload": {}},
                    {"target": "ALL", "topic": "news"}
                ]
            },
            "meta": publish_meta()
        });
        assert!(matches!(
            PublishEnvelope::from_value(value),
            Err(ProtocolError::InvalidPublish(_))
        ));
    }
}
