use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kinds exchanged with the chat service.
///
/// Kinds the client does not know about are preserved as [`MessageKind::Other`]
/// so newer servers can add kinds without breaking older clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Chat text, sent and received.
    ChatMessage,
    /// Outbound file metadata.
    FileUpload,
    /// Outbound trace selection change.
    TraceSelection,
    /// Inbound file change notification.
    FileUpdate,
    /// Inbound trace change notification.
    TraceUpdate,
    /// Any other kind string.
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::FileUpload => "file_upload",
            Self::TraceSelection => "trace_selection",
            Self::FileUpdate => "file_update",
            Self::TraceUpdate => "trace_update",
            Self::Other(kind) => kind,
        }
    }
}

impl From<String> for MessageKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "chat_message" => Self::ChatMessage,
            "file_upload" => Self::FileUpload,
            "trace_selection" => Self::TraceSelection,
            "file_update" => Self::FileUpdate,
            "trace_update" => Self::TraceUpdate,
            _ => Self::Other(kind),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(kind: &str) -> Self {
        Self::from(kind.to_string())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit exchanged over the connection in both directions.
///
/// Wire shape: `{"type": "<kind>", "data": <payload>, "timestamp": "<ISO-8601>"}`.
/// `data` defaults to `null` and `timestamp` is optional on inbound frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    /// Builds an envelope stamped with the current UTC time.
    pub fn new(kind: impl Into<MessageKind>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Some(timestamp_now()),
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Current UTC time as ISO-8601 with millisecond precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Inbound envelope routed by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ChatMessage(Value),
    FileUpdate(Value),
    TraceUpdate(Value),
    /// Kind without a consumer slot; ignored by dispatch.
    Unhandled(Envelope),
}

impl From<Envelope> for InboundEvent {
    fn from(envelope: Envelope) -> Self {
        match envelope.kind {
            MessageKind::ChatMessage => Self::ChatMessage(envelope.data),
            MessageKind::FileUpdate => Self::FileUpdate(envelope.data),
            MessageKind::TraceUpdate => Self::TraceUpdate(envelope.data),
            _ => Self::Unhandled(envelope),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn outbound_envelope_uses_type_data_timestamp_keys() {
        let envelope = Envelope::new("chat_message", json!({"text": "hi"}));
        let value: Value = serde_json::to_value(&envelope).expect("encode");

        assert_eq!(value["type"], "chat_message");
        assert_eq!(value["data"], json!({"text": "hi"}));
        let timestamp = value["timestamp"].as_str().expect("timestamp string");
        assert!(
            chrono::DateTime::parse_from_rfc3339(timestamp).is_ok(),
            "timestamp must be ISO-8601: {timestamp}"
        );
        assert!(timestamp.ends_with('Z'), "timestamp must be UTC: {timestamp}");
    }

    #[test]
    fn inbound_envelope_without_timestamp_or_data_is_accepted() {
        let envelope = Envelope::from_text(r#"{"type":"trace_update"}"#).expect("decode");
        assert_eq!(envelope.kind, MessageKind::TraceUpdate);
        assert_eq!(envelope.data, Value::Null);
        assert_eq!(envelope.timestamp, None);
    }

    #[test]
    fn envelope_without_type_is_rejected() {
        assert!(Envelope::from_text(r#"{"data":{"text":"hi"}}"#).is_err());
        assert!(Envelope::from_text("not json").is_err());
    }

    #[test]
    fn unknown_kind_survives_decode_and_encode() {
        let envelope = Envelope::from_text(r#"{"type":"typing","data":{"user":"ana"}}"#)
            .expect("decode");
        assert_eq!(envelope.kind, MessageKind::Other("typing".to_string()));

        let encoded = envelope.to_text().expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["type"], "typing");
    }

    #[test]
    fn kind_strings_map_to_known_variants() {
        for (text, kind) in [
            ("chat_message", MessageKind::ChatMessage),
            ("file_upload", MessageKind::FileUpload),
            ("trace_selection", MessageKind::TraceSelection),
            ("file_update", MessageKind::FileUpdate),
            ("trace_update", MessageKind::TraceUpdate),
        ] {
            assert_eq!(MessageKind::from(text), kind);
            assert_eq!(kind.as_str(), text);
        }
    }

    #[test]
    fn inbound_event_routes_by_kind() {
        let chat = Envelope::from_text(r#"{"type":"chat_message","data":"hello"}"#)
            .expect("decode");
        assert_eq!(InboundEvent::from(chat), InboundEvent::ChatMessage(json!("hello")));

        let file = Envelope::from_text(r#"{"type":"file_update","data":{"name":"a.log"}}"#)
            .expect("decode");
        assert_eq!(
            InboundEvent::from(file),
            InboundEvent::FileUpdate(json!({"name": "a.log"}))
        );

        let upload = Envelope::from_text(r#"{"type":"file_upload","data":{}}"#).expect("decode");
        assert!(matches!(InboundEvent::from(upload), InboundEvent::Unhandled(_)));
    }
}
