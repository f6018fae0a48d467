//! Account identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a registered messaging account.
///
/// Usually a phone-number-like string (e.g., "+15551234567"). The value is
/// opaque to the daemon: it is only compared, hashed and used as a file
/// name inside the state directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Creates a new AccountId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the identifier can safely be used as a single path
    /// component (no separators, not `.`/`..`, not empty).
    #[must_use]
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0 != "."
            && self.0 != ".."
            && !self.0.contains(['/', '\\', '\0'])
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for AccountId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_serializes_as_plain_string() {
        let id = AccountId::new("+15551234567");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"+15551234567\"");

        let parsed: AccountId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_path_safety() {
        assert!(AccountId::new("+15551234567").is_path_safe());
        assert!(!AccountId::new("").is_path_safe());
        assert!(!AccountId::new("..").is_path_safe());
        assert!(!AccountId::new("../etc/passwd").is_path_safe());
        assert!(!AccountId::new("a\\b").is_path_safe());
    }
}
