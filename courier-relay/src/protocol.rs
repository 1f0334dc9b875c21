//! JSON envelope protocol spoken over the relay WebSocket.
//!
//! Wire format (one UTF-8 text frame per envelope):
//! ```text
//! ┌──────────────────┬───────────────────────────────────────┐
//! │ "type": string   │ "data": JSON value                    │
//! │ closed kind set  │ kind-specific record, bound lazily    │
//! └──────────────────┴───────────────────────────────────────┘
//! ```
//!
//! `data` stays an untyped [`serde_json::Value`] until a handler binds it to
//! its own record with [`Envelope::bind`]. A payload that does not fit the
//! record aborts only that envelope; the connection keeps going.

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Status the relay assigns to a message it has accepted.
pub const STATUS_SENT: &str = "sent";

/// Envelope kinds understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// New chat message
    Message,
    /// Edit of a previously sent message
    EditMessage,
    /// Delete-for-everyone of a previously sent message
    DeleteMessage,
    /// Receiver has read a chat
    AckRead,
    /// Server accepted a message
    AckSent,
    /// Receiver's device has the message
    AckDelivered,
    /// Server rejected an envelope (outbound only)
    AckError,
    WebrtcOffer,
    WebrtcAnswer,
    WebrtcCandidate,
    WebrtcDelivered,
    WebrtcHangup,
    WebrtcDecline,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 13] = [
        EnvelopeKind::Message,
        EnvelopeKind::EditMessage,
        EnvelopeKind::DeleteMessage,
        EnvelopeKind::AckRead,
        EnvelopeKind::AckSent,
        EnvelopeKind::AckDelivered,
        EnvelopeKind::AckError,
        EnvelopeKind::WebrtcOffer,
        EnvelopeKind::WebrtcAnswer,
        EnvelopeKind::WebrtcCandidate,
        EnvelopeKind::WebrtcDelivered,
        EnvelopeKind::WebrtcHangup,
        EnvelopeKind::WebrtcDecline,
    ];

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Message => "message",
            EnvelopeKind::EditMessage => "edit_message",
            EnvelopeKind::DeleteMessage => "delete_message",
            EnvelopeKind::AckRead => "ack_read",
            EnvelopeKind::AckSent => "ack_sent",
            EnvelopeKind::AckDelivered => "ack_delivered",
            EnvelopeKind::AckError => "ack_error",
            EnvelopeKind::WebrtcOffer => "webrtc_offer",
            EnvelopeKind::WebrtcAnswer => "webrtc_answer",
            EnvelopeKind::WebrtcCandidate => "webrtc_candidate",
            EnvelopeKind::WebrtcDelivered => "webrtc_delivered",
            EnvelopeKind::WebrtcHangup => "webrtc_hangup",
            EnvelopeKind::WebrtcDecline => "webrtc_decline",
        }
    }

    /// Kinds whose `data._id` identifies a chat message.
    pub fn carries_message(&self) -> bool {
        matches!(
            self,
            EnvelopeKind::Message | EnvelopeKind::EditMessage | EnvelopeKind::DeleteMessage
        )
    }

    /// WebRTC call signaling kinds, relayed without inspection.
    pub fn is_signaling(&self) -> bool {
        matches!(
            self,
            EnvelopeKind::WebrtcOffer
                | EnvelopeKind::WebrtcAnswer
                | EnvelopeKind::WebrtcCandidate
                | EnvelopeKind::WebrtcDelivered
                | EnvelopeKind::WebrtcHangup
                | EnvelopeKind::WebrtcDecline
        )
    }
}

impl FromStr for EnvelopeKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvelopeKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape before the kind is resolved.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct RawEnvelopeRef<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a Value,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, data: Value) -> Self {
        Self { kind, data }
    }

    /// Build an envelope from a typed record.
    pub fn from_record<T: Serialize>(kind: EnvelopeKind, record: &T) -> Result<Self, ProtocolError> {
        let data =
            serde_json::to_value(record).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self { kind, data })
    }

    /// `ack_sent` carrying the server-assigned timestamp.
    pub fn sent_ack(ack: &SentAck) -> Result<Self, ProtocolError> {
        Self::from_record(EnvelopeKind::AckSent, ack)
    }

    /// `ack_error` explaining why an envelope was not relayed.
    pub fn error_ack(ack: &ErrorAck) -> Result<Self, ProtocolError> {
        Self::from_record(EnvelopeKind::AckError, ack)
    }

    /// Decode a text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Decode a binary frame holding UTF-8 JSON.
    pub fn decode_bytes(frame: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_slice(frame).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawEnvelope) -> Result<Self, ProtocolError> {
        let kind = raw.kind.parse()?;
        Ok(Self {
            kind,
            data: raw.data,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(&RawEnvelopeRef {
            kind: self.kind.as_str(),
            data: &self.data,
        })
        .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Re-project `data` into a handler record.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, BindError> {
        T::deserialize(&self.data).map_err(|e| BindError {
            kind: self.kind,
            target: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }

    /// Routing target from `data.receiver_id`, if present and non-empty.
    pub fn receiver_id(&self) -> Option<&str> {
        non_empty_str(&self.data, "receiver_id")
    }

    /// Message id used to index queued copies of message-bearing envelopes.
    ///
    /// Acknowledgments and signaling carry none, so a `delivered`
    /// acknowledgment never removes them from the queue.
    pub fn message_id(&self) -> Option<&str> {
        if self.kind.carries_message() {
            non_empty_str(&self.data, "_id")
        } else {
            None
        }
    }
}

fn non_empty_str<'a>(data: &'a Value, field: &str) -> Option<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Current time as RFC 3339 UTC, used for `server_ts`.
pub fn server_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ─── Records ──────────────────────────────────────────────────────────
//
// Every field is optional on the wire; missing fields bind to empty values.

/// `data` of `message` and `edit_message`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    #[serde(rename = "_id")]
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    /// Client-side creation time
    pub timestamp: String,
    /// Stamped by the relay on accept
    pub server_ts: String,
    pub chat_id: String,
    pub group_id: String,
    /// Content type chosen by the client (text, image, ...)
    #[serde(rename = "type")]
    pub content_type: String,
    pub status: String,
    pub deleted_for_everyone: i32,
    pub edited: i32,
}

/// `data` of `delete_message`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteForEveryone {
    #[serde(rename = "_id")]
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub chat_id: String,
    pub group_id: String,
    pub timestamp: String,
    pub server_ts: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentAck {
    pub message_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub chat_id: String,
    pub group_id: String,
    pub timestamp: String,
    pub server_ts: String,
}

impl SentAck {
    pub fn for_message(message: &ChatMessage) -> Self {
        Self {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            chat_id: message.chat_id.clone(),
            group_id: message.group_id.clone(),
            timestamp: message.timestamp.clone(),
            server_ts: message.server_ts.clone(),
        }
    }

    pub fn for_deletion(deletion: &DeleteForEveryone) -> Self {
        Self {
            message_id: deletion.id.clone(),
            sender_id: deletion.sender_id.clone(),
            receiver_id: deletion.receiver_id.clone(),
            chat_id: deletion.chat_id.clone(),
            group_id: deletion.group_id.clone(),
            timestamp: deletion.timestamp.clone(),
            server_ts: deletion.server_ts.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveredAck {
    pub message_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub chat_id: String,
    pub group_id: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadAck {
    pub sender_id: String,
    pub receiver_id: String,
    pub chat_id: String,
    pub group_id: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorAck {
    pub message_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub chat_id: String,
    pub group_id: String,
    pub timestamp: String,
    pub reason: String,
}

// ─── Errors ───────────────────────────────────────────────────────────

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Frame is not a `{type, data}` JSON object
    Decode(String),
    /// `type` is not a known kind
    UnknownType(String),
    Encode(String),
    /// WebSocket transport failure (client side)
    Connection(String),
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Decode(e) => write!(f, "Malformed envelope: {e}"),
            ProtocolError::UnknownType(t) => write!(f, "Unknown envelope type: {t:?}"),
            ProtocolError::Encode(e) => write!(f, "Encode error: {e}"),
            ProtocolError::Connection(e) => write!(f, "Connection error: {e}"),
            ProtocolError::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// `data` did not fit the record a handler expects.
#[derive(Debug, Clone)]
pub struct BindError {
    pub kind: EnvelopeKind,
    pub target: &'static str,
    pub reason: String,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cannot bind {} data to {}: {}",
            self.kind, self.target, self.reason
        )
    }
}

impl std::error::Error for BindError {}
