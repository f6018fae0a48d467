//! Normalized, protocol-agnostic representation of an inbound event.
//!
//! This is the `data` object clients receive inside a
//! `{"type": "message", "data": ...}` frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AccountId, ContactInfo, Content, InboundEvent, NormalizeError};

/// Coarse classification of the decoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Data,
    Receipt,
    Typing,
    Sync,
    /// The payload was missing or failed to decode
    Empty,
}

impl From<&Content> for ContentKind {
    fn from(content: &Content) -> Self {
        match content {
            Content::Data { .. } => Self::Data,
            Content::Receipt { .. } => Self::Receipt,
            Content::Typing { .. } => Self::Typing,
            Content::Sync => Self::Sync,
        }
    }
}

/// One inbound event as published to local clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Account that received the event
    pub account: AccountId,

    /// Sender address (number, or uuid for number-less senders)
    pub sender: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_device: Option<u32>,

    /// Sender's timestamp, milliseconds since epoch
    pub timestamp: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<u64>,

    /// When the daemon normalized the event
    pub received_at: DateTime<Utc>,

    pub kind: ContentKind,

    /// Decoded text body, when the payload carries one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Group the message was sent to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Attachments announced by the payload; zero for non-data events
    #[serde(default)]
    pub attachment_count: u32,

    /// Full structured payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Content>,

    /// Sender as found in the account's contact list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactInfo>,

    /// Display name from the contact, if it has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,

    /// Per-message decode failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NormalizedMessage {
    /// Builds a message from an inbound event.
    ///
    /// `lookup_contact` is called with the sender's identifier; returning
    /// `None` is normal and only leaves the contact fields empty.
    ///
    /// # Errors
    ///
    /// - `NormalizeError::MissingEnvelope` if the event carries no envelope
    /// - `NormalizeError::MissingSender` if the envelope has no usable address
    pub fn from_event<F>(
        account: &AccountId,
        event: &InboundEvent,
        lookup_contact: F,
    ) -> Result<Self, NormalizeError>
    where
        F: FnOnce(&str) -> Option<ContactInfo>,
    {
        let envelope = event
            .envelope
            .as_ref()
            .ok_or(NormalizeError::MissingEnvelope)?;
        let source = envelope
            .source
            .as_ref()
            .ok_or(NormalizeError::MissingSender)?;
        let sender = source
            .identifier()
            .ok_or(NormalizeError::MissingSender)?
            .to_string();

        let contact = lookup_contact(&sender);
        let contact_name = contact.as_ref().and_then(|c| c.name.clone());

        let (body, group_id, attachment_count) = match &event.content {
            Some(Content::Data {
                body,
                group_id,
                attachment_count,
                ..
            }) => (body.clone(), group_id.clone(), *attachment_count),
            _ => (None, None, 0),
        };

        Ok(Self {
            account: account.clone(),
            sender_uuid: source.uuid.clone(),
            sender,
            source_device: envelope.source_device,
            timestamp: envelope.timestamp,
            server_timestamp: envelope.server_timestamp,
            received_at: Utc::now(),
            kind: event
                .content
                .as_ref()
                .map(ContentKind::from)
                .unwrap_or(ContentKind::Empty),
            content: body,
            group_id,
            attachment_count,
            details: event.content.clone(),
            contact,
            contact_name,
            error: event.error.as_ref().map(ToString::to_string),
        })
    }
}
