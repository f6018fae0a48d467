//! Per-account receive loop.
//!
//! Each account gets one `AccountReceiveLoop`, running on its own OS
//! thread because `Session::receive_blocking` blocks for up to an hour.
//! The loop owns the account's session, publishes it to the registry once
//! initialized, and keeps calling the blocking receive until an explicit
//! fatal signal arrives.
//!
//! # Failure policy
//!
//! | Outcome of `receive_blocking` | Action                                  |
//! |-------------------------------|-----------------------------------------|
//! | `Ok(())` (timeout elapsed)    | link if now possible, call again        |
//! | `Io` / `ProtocolAssertion`    | log, back off, call again               |
//! | `Authorization`               | log, stop for good, registry untouched  |
//! | `Other`                       | log, stop                               |
//!
//! There is no cancellation: a loop ends only on the fatal outcomes above
//! or with the process.
//!
//! An account without local state keeps its loop running with a short
//! receive timeout and re-checks `exists()` after every clean return; the
//! session is initialized and registered as soon as the account is linked.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()`, `panic!()` in this module. Event handling
//! failures are logged and never reach the receive call.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use relay_core::{
    AccountId, EventHandler, InboundEvent, NormalizeError, NormalizedMessage, ReceiveError,
    SessionFactory, SetupError, SharedSession, DEFAULT_RECEIVE_TIMEOUT,
};

use crate::broadcast::Broadcaster;
use crate::registry::SessionRegistry;

// ============================================================================
// Retry Policy
// ============================================================================

/// Backoff applied between consecutive transient receive failures.
///
/// The first call after a clean return is never delayed. After `k`
/// failures in a row the delay is `initial * 2^(k-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

    /// Retries without any delay.
    pub const fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before the next call, given the number of consecutive
    /// transient failures so far.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (consecutive_failures - 1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Self::DEFAULT_INITIAL_BACKOFF,
            max_backoff: Self::DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Receive timeout used while an account waits to be linked.
pub const DEFAULT_LINK_CHECK_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Loop Context
// ============================================================================

/// Everything a receive loop needs besides its account id.
#[derive(Clone)]
pub struct LoopContext {
    /// Root of the per-account local state
    pub state_dir: PathBuf,
    pub factory: Arc<dyn SessionFactory>,
    pub registry: Arc<SessionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub retry: RetryPolicy,
    /// How often an unlinked account re-checks its local state
    pub link_check_interval: Duration,
}

/// Why a receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Credentials were rejected; the account will receive nothing more
    Unauthorized(String),
    /// Unclassified failure
    Failed(String),
}

impl std::fmt::Display for LoopExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized(reason) => write!(f, "authorization failed: {reason}"),
            Self::Failed(reason) => write!(f, "receive failed: {reason}"),
        }
    }
}

// ============================================================================
// Account Receive Loop
// ============================================================================

/// Drives one account's session.
pub struct AccountReceiveLoop {
    account: AccountId,
    session: SharedSession,
    registry: Arc<SessionRegistry>,
    broadcaster: Arc<Broadcaster>,
    retry: RetryPolicy,
    receive_timeout: Duration,
    link_check_interval: Duration,
    registered: bool,
}

impl AccountReceiveLoop {
    /// Creates the account's session and, if the account exists locally,
    /// initializes it and publishes it to the registry.
    ///
    /// A session for an account that does not exist yet is kept but not
    /// registered; the loop still runs and registers it once linked.
    ///
    /// # Errors
    ///
    /// `SetupError` from session construction or initialization.
    pub fn start(account: AccountId, ctx: &LoopContext) -> Result<Self, SetupError> {
        info!(account = %account, state_dir = %ctx.state_dir.display(), "Creating session");
        let session = ctx.factory.create(&account, &ctx.state_dir)?;

        let registered = if session.exists() {
            session.initialize()?;
            ctx.registry.put(account.clone(), Arc::clone(&session));
            true
        } else {
            info!(account = %account, "Account not registered locally, waiting for link");
            false
        };

        Ok(Self {
            account,
            session,
            registry: Arc::clone(&ctx.registry),
            broadcaster: Arc::clone(&ctx.broadcaster),
            retry: ctx.retry,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            link_check_interval: ctx.link_check_interval,
            registered,
        })
    }

    /// Overrides the timeout passed to each receive call.
    #[must_use]
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Whether the session has been published to the registry.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Initializes and registers the session if the account has been
    /// linked since the loop started. Initialization failures are retried
    /// on the next check.
    fn try_link(&mut self) {
        if self.registered || !self.session.exists() {
            return;
        }
        match self.session.initialize() {
            Ok(()) => {
                self.registry
                    .put(self.account.clone(), Arc::clone(&self.session));
                self.registered = true;
                info!(account = %self.account, "Account linked, session registered");
            }
            Err(e) => {
                warn!(
                    account = %self.account,
                    error = %e,
                    "Linked account failed to initialize, retrying at next check"
                );
            }
        }
    }

    /// Runs until a fatal receive error. Blocks the calling thread.
    pub fn run(mut self) -> LoopExit {
        let mut handler = AccountEventHandler {
            account: self.account.clone(),
            session: Arc::clone(&self.session),
            broadcaster: Arc::clone(&self.broadcaster),
        };
        let mut consecutive_failures: u32 = 0;

        info!(account = %self.account, registered = self.registered, "Receive loop started");

        loop {
            let delay = self.retry.delay_for(consecutive_failures);
            if !delay.is_zero() {
                debug!(
                    account = %self.account,
                    delay_ms = duration_millis(delay),
                    consecutive_failures,
                    "Backing off before next receive"
                );
                thread::sleep(delay);
            }

            let timeout = if self.registered {
                self.receive_timeout
            } else {
                self.link_check_interval
            };
            let result = self
                .session
                .receive_blocking(timeout, true, false, &mut handler);

            match result {
                Ok(()) => {
                    trace!(account = %self.account, "Receive returned, polling again");
                    consecutive_failures = 0;
                    self.try_link();
                }
                Err(ReceiveError::Io(reason)) => {
                    warn!(account = %self.account, error = %reason, "I/O error while receiving messages");
                    consecutive_failures = consecutive_failures.saturating_add(1);
                }
                Err(ReceiveError::ProtocolAssertion(reason)) => {
                    warn!(
                        account = %self.account,
                        error = %reason,
                        "Protocol assertion failed while receiving messages"
                    );
                    consecutive_failures = consecutive_failures.saturating_add(1);
                }
                Err(ReceiveError::Authorization(reason)) => {
                    error!(
                        account = %self.account,
                        error = %reason,
                        "Authorization failed, account will receive no more messages"
                    );
                    return LoopExit::Unauthorized(reason);
                }
                Err(ReceiveError::Other(reason)) => {
                    error!(
                        account = %self.account,
                        error = %reason,
                        "Unexpected receive failure, stopping receive loop"
                    );
                    return LoopExit::Failed(reason);
                }
            }
        }
    }
}

/// Handler invoked from inside `receive_blocking` on the loop's thread.
struct AccountEventHandler {
    account: AccountId,
    session: SharedSession,
    broadcaster: Arc<Broadcaster>,
}

impl EventHandler for AccountEventHandler {
    fn handle_event(&mut self, event: InboundEvent) {
        if let Some(decode_error) = &event.error {
            warn!(account = %self.account, error = %decode_error, "Failed to decode inbound message");
        }

        let session = &self.session;
        let message = NormalizedMessage::from_event(&self.account, &event, |sender| {
            session.get_contact(sender)
        });

        match message {
            Ok(message) => {
                let report = self.broadcaster.publish(&message);
                debug!(
                    account = %self.account,
                    sender = %message.sender,
                    kind = ?message.kind,
                    delivered = report.delivered,
                    dropped = report.dropped,
                    "Published inbound message"
                );
            }
            Err(NormalizeError::MissingEnvelope) => {
                debug!(account = %self.account, "Skipping event without envelope");
            }
            Err(e) => {
                warn!(account = %self.account, error = %e, "Dropping event that could not be normalized");
            }
        }
    }
}
