//! Protocol message types for daemon communication.

use crate::version::ProtocolVersion;
use relay_core::{AccountId, ContactInfo, NormalizedMessage};
use serde::{Deserialize, Serialize};

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Start receiving published messages
    Subscribe {
        /// Only receive messages for this account
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account: Option<AccountId>,
    },

    /// Stop receiving published messages
    Unsubscribe,

    /// Request the accounts that currently have a live session
    ListAccounts,

    /// Resolve an address against an account's contact list
    GetContact { account: AccountId, address: String },

    /// Start a receive loop for a newly linked account
    AddAccount { account: AccountId },

    /// Ping to check connection
    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn subscribe(account: Option<AccountId>) -> Self {
        Self::new(MessageType::Subscribe { account })
    }

    pub fn unsubscribe() -> Self {
        Self::new(MessageType::Unsubscribe)
    }

    pub fn list_accounts() -> Self {
        Self::new(MessageType::ListAccounts)
    }

    pub fn get_contact(account: AccountId, address: impl Into<String>) -> Self {
        Self::new(MessageType::GetContact {
            account,
            address: address.into(),
        })
    }

    pub fn add_account(account: AccountId) -> Self {
        Self::new(MessageType::AddAccount { account })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Machine-readable `code` values carried by `DaemonMessage::Error`.
pub mod error_code {
    /// The account has no initialized session yet
    pub const ACCOUNT_NOT_READY: &str = "account_not_ready";
    /// The subscriber set is full
    pub const TOO_MANY_CLIENTS: &str = "too_many_clients";
    /// The account id cannot be used
    pub const INVALID_ACCOUNT: &str = "invalid_account";
    /// The request line was not a valid client message
    pub const INVALID_MESSAGE: &str = "invalid_message";
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        /// Daemon's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// An inbound message for one of the accounts
    Message { data: Box<NormalizedMessage> },

    /// Accounts with a live session
    AccountList { accounts: Vec<AccountId> },

    /// Result of a contact lookup
    Contact {
        account: AccountId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contact: Option<ContactInfo>,
    },

    /// A receive loop was started (or was already running)
    AccountAdded { account: AccountId },

    Pong { seq: u64 },

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    /// Wraps a normalized message in the `{"type": "message", "data": ...}` frame.
    pub fn message(data: NormalizedMessage) -> Self {
        Self::Message {
            data: Box::new(data),
        }
    }

    pub fn account_list(accounts: Vec<AccountId>) -> Self {
        Self::AccountList { accounts }
    }

    pub fn contact(account: AccountId, contact: Option<ContactInfo>) -> Self {
        Self::Contact { account, contact }
    }

    pub fn account_added(account: AccountId) -> Self {
        Self::AccountAdded { account }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}
