//! Data models for transcript messages and chat payloads.

use std::collections::BTreeSet;

use crate::types::{ConclaveError, Result};

/// Opaque unique identifier of a transcript message.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Vec<u8>);

impl MessageId {
    /// Creates an id from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the id is empty (never valid in a transcript).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for MessageId {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for MessageId {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

/// A payload message exchanged under an established session.
///
/// `parents` are the message's direct causal predecessors; `readers` are
/// the intended recipients, excluding the author. The body is opaque to the
/// transcript; an empty body marks a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptMessage {
    /// Unique message id.
    pub id: MessageId,
    /// Authoring participant.
    pub author: String,
    /// Direct causal predecessors.
    pub parents: BTreeSet<MessageId>,
    /// Intended recipients (author excluded).
    pub readers: BTreeSet<String>,
    /// Opaque payload.
    pub body: Vec<u8>,
}

impl TranscriptMessage {
    /// Creates a new transcript message.
    pub fn new(
        id: impl Into<MessageId>,
        author: impl Into<String>,
        parents: impl IntoIterator<Item = MessageId>,
        readers: impl IntoIterator<Item = String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            parents: parents.into_iter().collect(),
            readers: readers.into_iter().collect(),
            body: body.into(),
        }
    }

    /// Everyone who sees this message: the author plus all readers.
    pub fn members(&self) -> BTreeSet<String> {
        let mut members = self.readers.clone();
        members.insert(self.author.clone());
        members
    }

    /// Whether this is a control message (empty body).
    pub fn is_control(&self) -> bool {
        self.body.is_empty()
    }
}

/// Context for a reply payload, linking it to the original message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    /// Id of the message being replied to.
    pub message_id: String,
    /// Preview of the original message (truncated by the sender).
    pub preview: Option<String>,
}

/// Decoded chat payload carried in a transcript message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPayload {
    /// The message text.
    pub text: String,
    /// Reply context if this payload is a reply.
    pub reply_context: Option<ReplyContext>,
}

impl ChatPayload {
    /// Creates a plain text payload.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_context: None,
        }
    }

    /// Encodes the payload as a message body.
    ///
    /// Plain text is carried as-is; replies use the structured JSON shape.
    pub fn encode(&self) -> Vec<u8> {
        match &self.reply_context {
            None => self.text.as_bytes().to_vec(),
            Some(reply) => {
                let mut reply_json = serde_json::Map::new();
                reply_json.insert("id".to_string(), reply.message_id.clone().into());
                if let Some(preview) = &reply.preview {
                    reply_json.insert("preview".to_string(), preview.clone().into());
                }
                let json = serde_json::json!({
                    "text": self.text,
                    "replyTo": reply_json,
                });
                json.to_string().into_bytes()
            }
        }
    }

    /// Parses a message body into a payload.
    ///
    /// Bodies starting with `{` are tried as the structured JSON shape
    /// first; anything else is plain text.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body).map_err(|e| {
            ConclaveError::MalformedMessage(format!("Invalid UTF-8 in payload: {e}"))
        })?;

        if text.starts_with('{') {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(text) {
                if let Some(message_text) = json.get("text").and_then(|v| v.as_str()) {
                    let reply_context = json.get("replyTo").and_then(|r| {
                        Some(ReplyContext {
                            message_id: r.get("id")?.as_str()?.to_string(),
                            preview: r
                                .get("preview")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                        })
                    });
                    return Ok(Self {
                        text: message_text.to_string(),
                        reply_context,
                    });
                }
            }
        }

        Ok(Self::new(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_message_id_debug_is_hex() {
        let id = MessageId::new(vec![0xAB, 0xCD]);
        assert_eq!(format!("{id:?}"), "MessageId(abcd)");
        assert_eq!(id.to_string(), "abcd");
    }

    #[test]
    fn test_members_includes_author() {
        let message = TranscriptMessage::new(
            "m1",
            "alice",
            [],
            readers(&["bob", "carol"]),
            b"hi".to_vec(),
        );
        let members = message.members();
        assert_eq!(members.len(), 3);
        assert!(members.contains("alice"));
        assert!(members.contains("bob"));
        assert!(members.contains("carol"));
    }

    #[test]
    fn test_control_message() {
        let message =
            TranscriptMessage::new("m1", "alice", [], readers(&["bob"]), Vec::new());
        assert!(message.is_control());
    }

    #[test]
    fn test_payload_plain_roundtrip() {
        let payload = ChatPayload::new("Hello there");
        let parsed = ChatPayload::parse(&payload.encode()).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_payload_reply_roundtrip() {
        let payload = ChatPayload {
            text: "Sure thing".to_string(),
            reply_context: Some(ReplyContext {
                message_id: "6d31".to_string(),
                preview: Some("Can you...".to_string()),
            }),
        };
        let parsed = ChatPayload::parse(&payload.encode()).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_payload_json_without_text_is_plain() {
        let body = br#"{"key": "value"}"#;
        let parsed = ChatPayload::parse(body).unwrap();
        assert_eq!(parsed.text, r#"{"key": "value"}"#);
        assert!(parsed.reply_context.is_none());
    }

    #[test]
    fn test_payload_invalid_utf8() {
        let result = ChatPayload::parse(&[0xFF, 0xFE]);
        assert!(matches!(result, Err(ConclaveError::MalformedMessage(_))));
    }
}
