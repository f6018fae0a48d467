//! Contact records kept by a session.

use serde::{Deserialize, Serialize};

use crate::event::Address;

/// A contact as known to an account's local state.
///
/// Field names follow the on-disk account format (`profileKey`), which is
/// also what clients see inside a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    /// Display name chosen by the account owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Address of the contact
    pub address: Address,

    /// Conversation colour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    /// Base64 profile key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_key: Option<String>,
}

impl ContactInfo {
    /// Creates a contact with only an address.
    pub fn new(address: Address) -> Self {
        Self {
            name: None,
            address,
            color: None,
            profile_key: None,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns true if this contact is reachable at `address`
    /// (matched by number or by uuid).
    pub fn matches(&self, address: &str) -> bool {
        self.address.number.as_deref() == Some(address)
            || self.address.uuid.as_deref() == Some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_reads_camel_case_profile_key() {
        let json = r#"{
            "name": "Bob",
            "address": {"number": "+15550000002"},
            "profileKey": "c2VjcmV0"
        }"#;
        let contact: ContactInfo = serde_json::from_str(json).unwrap();
        assert_eq!(contact.name.as_deref(), Some("Bob"));
        assert_eq!(contact.profile_key.as_deref(), Some("c2VjcmV0"));
        assert!(contact.color.is_none());
    }

    #[test]
    fn test_matches_number_or_uuid() {
        let contact = ContactInfo::new(Address {
            number: Some("+15550000002".to_string()),
            uuid: Some("7b0b1c9e-1f7c-4d4e-9d7e-000000000002".to_string()),
        });
        assert!(contact.matches("+15550000002"));
        assert!(contact.matches("7b0b1c9e-1f7c-4d4e-9d7e-000000000002"));
        assert!(!contact.matches("+15550000003"));
    }
}
