//! The contract between the daemon and a messaging backend.
//!
//! A `Session` owns everything protocol-specific for one account
//! (keys, connection, contact store). The daemon only ever drives it
//! through the methods below, from a dedicated thread per account.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::{AccountId, ContactInfo, InboundEvent, ReceiveError, SetupError};

/// Timeout passed to every blocking receive call (one hour).
///
/// With `return_on_timeout` set, the call returns at least this often,
/// which bounds how long a loop goes without re-evaluating its state.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Receives events from a blocking receive call.
///
/// Invoked synchronously on the thread that called
/// [`Session::receive_blocking`], never concurrently for the same
/// account. Implementations must not panic or propagate failures back
/// into the receive call.
pub trait EventHandler {
    fn handle_event(&mut self, event: InboundEvent);
}

impl<F> EventHandler for F
where
    F: FnMut(InboundEvent),
{
    fn handle_event(&mut self, event: InboundEvent) {
        self(event)
    }
}

/// Per-account handle to the remote messaging protocol.
pub trait Session: Send + Sync {
    /// Returns true if the account is registered/linked locally.
    fn exists(&self) -> bool;

    /// Loads protocol state. Called once, before the session is published.
    ///
    /// # Errors
    ///
    /// `SetupError` if the local state is malformed.
    fn initialize(&self) -> Result<(), SetupError>;

    /// Looks up a contact by number or uuid. Absence is not an error.
    fn get_contact(&self, address: &str) -> Option<ContactInfo>;

    /// Blocks until `timeout` elapses (when `return_on_timeout` is set) or
    /// the connection fails, invoking `handler` once per inbound event.
    ///
    /// # Errors
    ///
    /// - `ReceiveError::Io` / `ReceiveError::ProtocolAssertion` for
    ///   transient failures
    /// - `ReceiveError::Authorization` when credentials are no longer valid
    fn receive_blocking(
        &self,
        timeout: Duration,
        return_on_timeout: bool,
        skip_attachments: bool,
        handler: &mut dyn EventHandler,
    ) -> Result<(), ReceiveError>;
}

/// Shared, thread-safe session handle as stored in the registry.
pub type SharedSession = Arc<dyn Session>;

/// Creates sessions bound to an account and a local state directory.
pub trait SessionFactory: Send + Sync {
    /// # Errors
    ///
    /// `SetupError` for unrecoverable construction problems; these are
    /// never retried.
    fn create(&self, account: &AccountId, state_dir: &Path) -> Result<SharedSession, SetupError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closures_are_event_handlers() {
        let mut seen = Vec::new();
        {
            let mut handler = |event: InboundEvent| seen.push(event);
            let handler: &mut dyn EventHandler = &mut handler;
            handler.handle_event(InboundEvent::text("+15550000002", "one", 1));
            handler.handle_event(InboundEvent::text("+15550000002", "two", 2));
        }
        assert_eq!(seen.len(), 2);
    }
}
