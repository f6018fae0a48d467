//! Process-wide registry of live account sessions.
//!
//! Receive loops publish their session here once it is initialized;
//! request handlers read it to answer queries such as contact lookups.
//!
//! # Concurrency
//!
//! Backed by a sharded concurrent map. Writers for distinct accounts do
//! not contend, writers for the same account are serialized by the shard
//! lock, and readers receive a cloned `Arc` so they always see a whole
//! session (either the old or the new one, never a partial value).
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()`, `panic!()` in this module. A missing
//! entry is an ordinary `None`, never an error.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use relay_core::{AccountId, SharedSession};

/// Concurrent `AccountId -> Session` map.
///
/// Explicitly owned and injected (`Arc<SessionRegistry>`) into the
/// supervisor and the socket server; there is no global instance.
/// Entries are never removed: an account whose loop stopped keeps its
/// last session visible for read-only queries.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<AccountId, SharedSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry wrapped for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Inserts or replaces the session for `account`.
    ///
    /// Returns the replaced session, if any (re-registration after a
    /// relink).
    pub fn put(&self, account: AccountId, session: SharedSession) -> Option<SharedSession> {
        let previous = self.sessions.insert(account.clone(), session);
        if previous.is_some() {
            info!(account = %account, "Session replaced in registry");
        } else {
            info!(
                account = %account,
                total_accounts = self.sessions.len(),
                "Session registered"
            );
        }
        previous
    }

    /// Returns the live session for `account`, or `None` if it is not (yet)
    /// initialized.
    pub fn get(&self, account: &AccountId) -> Option<SharedSession> {
        let session = self.sessions.get(account).map(|entry| Arc::clone(entry.value()));
        if session.is_none() {
            debug!(account = %account, "No live session for account");
        }
        session
    }

    pub fn contains(&self, account: &AccountId) -> bool {
        self.sessions.contains_key(account)
    }

    /// Snapshot of registered accounts, sorted.
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> =
            self.sessions.iter().map(|entry| entry.key().clone()).collect();
        accounts.sort();
        accounts
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
