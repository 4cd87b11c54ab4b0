use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Value stored under a shared-state key. Primitives, null, lists and maps.
pub type StateValue = serde_json::Value;

/// Kind of a coordinator channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Replace the attribute wholesale.
    StateUpdate,
    /// Merge the value into a mapping attribute.
    StateUpdatePartial,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::StateUpdate => "state-update",
            MessageKind::StateUpdatePartial => "state-update-partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "state-update" => Some(MessageKind::StateUpdate),
            "state-update-partial" => Some(MessageKind::StateUpdatePartial),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on the coordinator channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub attribute: String,
    pub value: StateValue,
}

/// Lenient decode target: the kind is kept as text so unknown kinds are
/// distinguishable from malformed frames.
#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type", alias = "message")]
    kind: Option<String>,
    attribute: Option<String>,
    #[serde(default)]
    value: StateValue,
}

impl ChannelMessage {
    pub fn update(attribute: impl Into<String>, value: StateValue) -> Self {
        Self {
            kind: MessageKind::StateUpdate,
            attribute: attribute.into(),
            value,
        }
    }

    pub fn partial(attribute: impl Into<String>, value: StateValue) -> Self {
        Self {
            kind: MessageKind::StateUpdatePartial,
            attribute: attribute.into(),
            value,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a text frame.
    ///
    /// Returns `Ok(None)` for well-formed frames of an unknown (or absent)
    /// kind, which receivers ignore. Malformed JSON is an error.
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let raw: RawMessage = serde_json::from_str(text)?;
        let Some(kind) = raw.kind.as_deref().and_then(MessageKind::parse) else {
            return Ok(None);
        };
        let attribute = raw.attribute.ok_or(ProtocolError::MissingField("attribute"))?;
        Ok(Some(Self {
            kind,
            attribute,
            value: raw.value,
        }))
    }
}

/// Transfer progress published per watched source under the
/// `transfer.<source>` state key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub source: String,
    pub files_transferred: u64,
    pub files_failed: u64,
    pub files_retried: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_per_sec: f64,
    pub total_size: u64,
    pub last_exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_uses_type_field() {
        let msg = ChannelMessage::update("visit", json!("cm12345-1"));
        let text = msg.encode().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "state-update");
        assert_eq!(parsed["attribute"], "visit");
        assert_eq!(parsed["value"], "cm12345-1");
    }

    #[test]
    fn test_decode_accepts_legacy_message_field() {
        let text = r#"{"message": "state-update-partial", "attribute": "ids", "value": {"a": 1}}"#;
        let msg = ChannelMessage::decode(text).unwrap().unwrap();
        assert_eq!(msg.kind, MessageKind::StateUpdatePartial);
        assert_eq!(msg.attribute, "ids");
        assert_eq!(msg.value, json!({"a": 1}));
    }

    #[test]
    fn test_decode_unknown_kind_is_ignored() {
        let text = r#"{"type": "refresh", "attribute": "x", "value": 1}"#;
        assert!(ChannelMessage::decode(text).unwrap().is_none());

        let text = r#"{"attribute": "x", "value": 1}"#;
        assert!(ChannelMessage::decode(text).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            ChannelMessage::decode("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ChannelMessage::decode(r#"{"type": "state-update", "value": 1}"#),
            Err(ProtocolError::MissingField("attribute"))
        ));
    }

    #[test]
    fn test_missing_value_decodes_as_null() {
        let msg = ChannelMessage::decode(r#"{"type": "state-update", "attribute": "k"}"#)
            .unwrap()
            .unwrap();
        assert!(msg.value.is_null());
    }
}
