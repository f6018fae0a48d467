//! Fan-out of published messages to connected socket clients.
//!
//! Receive loops call [`Broadcaster::publish`] from their own OS threads;
//! the socket server adds and removes clients from async tasks. Neither
//! side ever waits on a client's socket:
//!
//! ```text
//! ┌───────────────┐  publish()  ┌─────────────┐  try_send  ┌──────────────┐
//! │ receive loop  │────────────▶│ Broadcaster │───────────▶│ client queue │──▶ writer task ──▶ socket
//! │ (per account) │             │  (RwLock)   │            │ (bounded)    │
//! └───────────────┘             └─────────────┘            └──────────────┘
//! ```
//!
//! A full or closed queue is a per-client failure: the client is dropped
//! from the set and its connection is cancelled. Delivery to the other
//! clients continues.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()`, `panic!()` in this module; `publish`
//! never returns an error.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use relay_core::{AccountId, NormalizedMessage};
use relay_protocol::DaemonMessage;

/// Maximum number of concurrently subscribed clients.
pub const MAX_CLIENTS: usize = 10;

/// Frames a client may have queued before it counts as unresponsive.
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

/// Unique identifier for a client connection
pub type ClientId = String;

/// One serialized JSON frame, shared between all recipients.
pub type Frame = Arc<str>;

/// What the broadcaster holds for each subscribed client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Outbound queue drained by the client's writer task
    pub sender: mpsc::Sender<Frame>,

    /// Only deliver messages for this account (None = all accounts)
    pub filter: Option<AccountId>,

    /// Cancelled when the broadcaster gives up on the client
    pub disconnect: CancellationToken,
}

impl ClientHandle {
    pub fn new(sender: mpsc::Sender<Frame>, filter: Option<AccountId>) -> Self {
        Self {
            sender,
            filter,
            disconnect: CancellationToken::new(),
        }
    }

    fn wants(&self, account: &AccountId) -> bool {
        self.filter.as_ref().map_or(true, |f| f == account)
    }
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Clients the frame was queued for
    pub delivered: usize,
    /// Clients that failed and were removed
    pub dropped: usize,
}

/// Errors from client set management.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("too many clients (max: {max})")]
    TooManyClients { max: usize },
}

/// The set of connected clients plus the fan-out operation.
pub struct Broadcaster {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    max_clients: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_max_clients(MAX_CLIENTS)
    }

    pub fn with_max_clients(max_clients: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            max_clients,
        }
    }

    /// Adds a client, or replaces the handle of an existing one.
    ///
    /// # Errors
    ///
    /// `BroadcastError::TooManyClients` if the set is full and `client_id`
    /// is not already a member.
    pub fn add(&self, client_id: ClientId, handle: ClientHandle) -> Result<(), BroadcastError> {
        let mut clients = self.clients.write();
        if clients.len() >= self.max_clients && !clients.contains_key(&client_id) {
            return Err(BroadcastError::TooManyClients {
                max: self.max_clients,
            });
        }
        debug!(client_id = %client_id, filter = ?handle.filter, "Added client");
        clients.insert(client_id, handle);
        Ok(())
    }

    /// Removes a client. Returns true if it was present.
    pub fn remove(&self, client_id: &str) -> bool {
        let removed = self.clients.write().remove(client_id).is_some();
        if removed {
            debug!(client_id = %client_id, "Removed client");
        }
        removed
    }

    /// Removes a client only if it is still registered with `sender`'s
    /// queue. A connection uses this so it never evicts a newer connection
    /// that reused its client id.
    pub fn remove_if_current(&self, client_id: &str, sender: &mpsc::Sender<Frame>) -> bool {
        let mut clients = self.clients.write();
        let current = clients
            .get(client_id)
            .is_some_and(|handle| handle.sender.same_channel(sender));
        if current {
            clients.remove(client_id);
            debug!(client_id = %client_id, "Removed client");
        }
        current
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Publishes a message to every client currently in the set.
    ///
    /// Serializes once, then queues the frame for each matching client
    /// without waiting. Clients whose queue is full or closed are removed
    /// and their connection cancelled.
    pub fn publish(&self, message: &NormalizedMessage) -> PublishReport {
        let frame: Frame = match serde_json::to_string(&DaemonMessage::message(message.clone())) {
            Ok(json) => json.into(),
            Err(e) => {
                error!(account = %message.account, error = %e, "Failed to serialize message");
                return PublishReport::default();
            }
        };

        self.fan_out(&message.account, frame)
    }

    fn fan_out(&self, account: &AccountId, frame: Frame) -> PublishReport {
        let mut report = PublishReport::default();
        let mut failed: Vec<(ClientId, ClientHandle)> = Vec::new();

        {
            let clients = self.clients.read();
            for (client_id, handle) in clients.iter() {
                if !handle.wants(account) {
                    continue;
                }

                match handle.sender.try_send(Arc::clone(&frame)) {
                    Ok(()) => {
                        trace!(client_id = %client_id, "Queued frame");
                        report.delivered += 1;
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            client_id = %client_id,
                            capacity = CLIENT_QUEUE_CAPACITY,
                            "Client queue full, dropping slow client"
                        );
                        failed.push((client_id.clone(), handle.clone()));
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(client_id = %client_id, "Client queue closed");
                        failed.push((client_id.clone(), handle.clone()));
                    }
                }
            }
        }

        if !failed.is_empty() {
            let mut clients = self.clients.write();
            for (client_id, handle) in failed {
                handle.disconnect.cancel();
                // The id may have been re-added with a fresh queue meanwhile.
                let same = clients
                    .get(&client_id)
                    .is_some_and(|current| current.sender.same_channel(&handle.sender));
                if same {
                    clients.remove(&client_id);
                    report.dropped += 1;
                    debug!(client_id = %client_id, "Removed failed client");
                }
            }
        }

        report
    }
}
