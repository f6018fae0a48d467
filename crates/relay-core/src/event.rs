//! Inbound protocol events as delivered by a session's receive call.
//!
//! These are closed types: a backend decodes whatever the remote protocol
//! hands it into exactly these shapes before invoking the event handler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Addressing
// ============================================================================

/// Address of a remote party.
///
/// Either part may be missing (older peers only have a number, sealed
/// senders may only expose a uuid).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    /// E.164 phone number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,

    /// Account uuid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl Address {
    /// Creates an address from a number only.
    pub fn from_number(number: impl Into<String>) -> Self {
        Self {
            number: Some(number.into()),
            uuid: None,
        }
    }

    /// Returns the preferred identifier: the number, falling back to uuid.
    pub fn identifier(&self) -> Option<&str> {
        self.number.as_deref().or(self.uuid.as_deref())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Transport-level kind of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    #[default]
    Ciphertext,
    PrekeyBundle,
    Receipt,
    UnidentifiedSender,
    #[serde(other)]
    Unknown,
}

/// Sender identity and timing metadata of one inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender address (absent for sealed-sender envelopes that failed to unseal)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Address>,

    /// Sender device id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_device: Option<u32>,

    /// Client timestamp, milliseconds since epoch
    pub timestamp: u64,

    /// Server receive timestamp, milliseconds since epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<u64>,

    #[serde(default)]
    pub kind: EnvelopeKind,
}

impl Envelope {
    /// Creates a ciphertext envelope from `sender` at `timestamp`.
    pub fn from_sender(sender: Address, timestamp: u64) -> Self {
        Self {
            source: Some(sender),
            source_device: None,
            timestamp,
            server_timestamp: None,
            kind: EnvelopeKind::Ciphertext,
        }
    }
}

// ============================================================================
// Content
// ============================================================================

/// Kind of a delivery/read receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Delivery,
    Read,
    Viewed,
}

/// Typing indicator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingAction {
    Started,
    Stopped,
}

/// Decoded payload of an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// A regular message
    Data {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
        #[serde(default)]
        expires_in_seconds: u32,
        /// Number of attachment pointers (transfer is the backend's business)
        #[serde(default)]
        attachment_count: u32,
    },

    /// Delivery or read receipt for earlier messages
    Receipt {
        kind: ReceiptKind,
        #[serde(default)]
        timestamps: Vec<u64>,
    },

    /// Typing indicator
    Typing { action: TypingAction },

    /// Sync message from another device of the same account
    Sync,
}

impl Content {
    /// Creates a plain text data message.
    pub fn text(body: impl Into<String>) -> Self {
        Self::Data {
            body: Some(body.into()),
            group_id: None,
            expires_in_seconds: 0,
            attachment_count: 0,
        }
    }
}

// ============================================================================
// Inbound Event
// ============================================================================

/// A per-message decode failure reported alongside an event.
///
/// Never aborts a receive loop; it is carried to clients in the
/// normalized message instead.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct DecodeError {
    pub message: String,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One `(envelope, content, error)` triple handed to the event handler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub envelope: Option<Envelope>,

    #[serde(default)]
    pub content: Option<Content>,

    #[serde(default, skip_serializing)]
    pub error: Option<DecodeError>,
}

impl InboundEvent {
    /// Creates a successfully decoded event.
    pub fn new(envelope: Envelope, content: Content) -> Self {
        Self {
            envelope: Some(envelope),
            content: Some(content),
            error: None,
        }
    }

    /// Creates an event whose content could not be decoded.
    pub fn failed(envelope: Option<Envelope>, error: DecodeError) -> Self {
        Self {
            envelope,
            content: None,
            error: Some(error),
        }
    }

    /// Convenience constructor for a text message from `sender`.
    pub fn text(sender: impl Into<String>, body: impl Into<String>, timestamp: u64) -> Self {
        Self::new(
            Envelope::from_sender(Address::from_number(sender), timestamp),
            Content::text(body),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_identifier_prefers_number() {
        let addr = Address {
            number: Some("+15550000001".to_string()),
            uuid: Some("uuid-1".to_string()),
        };
        assert_eq!(addr.identifier(), Some("+15550000001"));

        let sealed = Address {
            number: None,
            uuid: Some("uuid-1".to_string()),
        };
        assert_eq!(sealed.identifier(), Some("uuid-1"));
        assert_eq!(Address::default().identifier(), None);
    }

    #[test]
    fn test_unknown_envelope_kind_is_tolerated() {
        let json = r#"{"timestamp": 1, "kind": "something_new"}"#;
        let envelope: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Unknown);
        assert!(envelope.source.is_none());
    }

    #[test]
    fn test_content_is_tagged_by_type() {
        let json = r#"{"type": "receipt", "kind": "read", "timestamps": [10, 11]}"#;
        let content: Content = serde_json::from_str(json).unwrap();
        assert_eq!(
            content,
            Content::Receipt {
                kind: ReceiptKind::Read,
                timestamps: vec![10, 11],
            }
        );
    }

    #[test]
    fn test_event_from_spool_json() {
        let json = r#"{
            "envelope": {"source": {"number": "+15550000002"}, "timestamp": 1700000000000},
            "content": {"type": "data", "body": "hi"}
        }"#;
        let event: InboundEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, InboundEvent::text("+15550000002", "hi", 1_700_000_000_000));
    }
}
