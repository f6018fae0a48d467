//! Error taxonomy shared by sessions and the daemon's receive loops.

use std::path::PathBuf;

use crate::AccountId;
use thiserror::Error;

/// Failure to construct or initialize an account's session.
///
/// These are configuration problems: a receive loop never retries them.
#[derive(Error, Debug, Clone)]
pub enum SetupError {
    /// The local state directory is missing or unusable
    #[error("state directory {path} unusable: {reason}")]
    StateDir { path: PathBuf, reason: String },

    /// The account's stored state could not be parsed
    #[error("malformed state for account {account} at {path}: {reason}")]
    MalformedState {
        account: AccountId,
        path: PathBuf,
        reason: String,
    },

    /// The account identifier cannot be mapped to local state
    #[error("invalid account identifier: {0:?}")]
    InvalidAccount(String),

    /// The receive thread could not be started
    #[error("failed to spawn receive loop for {account}: {reason}")]
    Spawn { account: AccountId, reason: String },
}

/// Failure of one blocking receive call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    /// Transient transport failure; the connection is expected to recover
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal inconsistency surfaced by the protocol layer
    #[error("protocol assertion failed: {0}")]
    ProtocolAssertion(String),

    /// Credentials were revoked or expired
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// Anything the backend could not classify
    #[error("unexpected failure: {0}")]
    Other(String),
}

impl ReceiveError {
    /// Returns true if the receive loop should try again after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ProtocolAssertion(_))
    }
}

impl From<std::io::Error> for ReceiveError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Failure to turn an inbound event into a publishable message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("event has no envelope")]
    MissingEnvelope,

    #[error("envelope has no sender address")]
    MissingSender,
}
