//! Spawns and tracks one receive loop per account.
//!
//! The supervisor keeps only spawn bookkeeping: which accounts have a
//! loop thread and how finished ones ended. It never restarts a loop on
//! its own; a stopped account comes back only through an explicit
//! [`Supervisor::spawn`] (e.g. after relinking).

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::{AccountId, SetupError};

use crate::broadcast::Broadcaster;
use crate::receiver::{AccountReceiveLoop, LoopContext, LoopExit};
use crate::registry::SessionRegistry;

/// How often finished loop threads are joined and logged.
pub const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Result a loop thread hands back to the supervisor.
pub type LoopOutcome = Result<LoopExit, SetupError>;

pub struct Supervisor {
    ctx: LoopContext,
    loops: Mutex<HashMap<AccountId, JoinHandle<LoopOutcome>>>,
}

impl Supervisor {
    pub fn new(ctx: LoopContext) -> Self {
        Self {
            ctx,
            loops: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.ctx.broadcaster
    }

    /// Starts a receive loop thread for `account`.
    ///
    /// Returns `Ok(false)` if a loop for the account is already running.
    /// A running loop for an account that was not yet linked registers the
    /// session on its own once the account's local state appears.
    /// Setup failures inside the thread (session construction, initialize)
    /// are reported through [`Supervisor::reap_finished`].
    ///
    /// # Errors
    ///
    /// - `SetupError::InvalidAccount` if the id cannot name local state
    /// - `SetupError::Spawn` if the OS refuses a new thread
    pub fn spawn(&self, account: AccountId) -> Result<bool, SetupError> {
        if !account.is_path_safe() {
            return Err(SetupError::InvalidAccount(account.as_str().to_string()));
        }

        let mut loops = self.loops.lock();

        if let Some(existing) = loops.get(&account) {
            if !existing.is_finished() {
                debug!(account = %account, "Receive loop already running");
                return Ok(false);
            }
            if let Some(finished) = loops.remove(&account) {
                log_outcome(&account, finished.join());
            }
        }

        let ctx = self.ctx.clone();
        let thread_account = account.clone();
        let handle = thread::Builder::new()
            .name(format!("account-{account}"))
            .spawn(move || run_account(thread_account, ctx))
            .map_err(|e| SetupError::Spawn {
                account: account.clone(),
                reason: e.to_string(),
            })?;

        info!(account = %account, "Receive loop spawned");
        loops.insert(account, handle);
        Ok(true)
    }

    /// Spawns loops for every account, logging failures. Returns how many
    /// loops were started.
    pub fn spawn_all(&self, accounts: impl IntoIterator<Item = AccountId>) -> usize {
        let mut started = 0;
        for account in accounts {
            match self.spawn(account.clone()) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => error!(account = %account, error = %e, "Failed to spawn receive loop"),
            }
        }
        started
    }

    /// Accounts whose loop thread is still alive, sorted.
    pub fn running_accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> = self
            .loops
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(account, _)| account.clone())
            .collect();
        accounts.sort();
        accounts
    }

    /// Joins finished loop threads and returns their outcomes.
    ///
    /// A loop that panicked is reported as `LoopExit::Failed`.
    pub fn reap_finished(&self) -> Vec<(AccountId, LoopOutcome)> {
        let finished: Vec<(AccountId, JoinHandle<LoopOutcome>)> = {
            let mut loops = self.loops.lock();
            let done: Vec<AccountId> = loops
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(account, _)| account.clone())
                .collect();
            done.into_iter()
                .filter_map(|account| loops.remove(&account).map(|h| (account, h)))
                .collect()
        };

        finished
            .into_iter()
            .map(|(account, handle)| {
                let outcome = match handle.join() {
                    Ok(outcome) => outcome,
                    Err(_) => Ok(LoopExit::Failed("receive loop panicked".to_string())),
                };
                log_outcome(&account, Ok(outcome.clone()));
                (account, outcome)
            })
            .collect()
    }

    /// Periodically reaps finished loops until `cancel_token` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Reaper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = supervisor.reap_finished();
                        if !reaped.is_empty() {
                            debug!(count = reaped.len(), "Reaped finished receive loops");
                        }
                    }
                }
            }
        })
    }
}

/// Body of a loop thread.
fn run_account(account: AccountId, ctx: LoopContext) -> LoopOutcome {
    match AccountReceiveLoop::start(account.clone(), &ctx) {
        Ok(receive_loop) => Ok(receive_loop.run()),
        Err(e) => {
            error!(account = %account, error = %e, "Failed to start receive loop");
            Err(e)
        }
    }
}

fn log_outcome(account: &AccountId, joined: thread::Result<LoopOutcome>) {
    match joined {
        Ok(Ok(exit)) => warn!(account = %account, reason = %exit, "Receive loop stopped"),
        Ok(Err(e)) => warn!(account = %account, error = %e, "Receive loop never started"),
        Err(_) => error!(account = %account, "Receive loop panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use relay_core::{SessionFactory, SharedSession};

    struct NoStateFactory;

    impl SessionFactory for NoStateFactory {
        fn create(&self, account: &AccountId, state_dir: &Path) -> Result<SharedSession, SetupError> {
            Err(SetupError::MalformedState {
                account: account.clone(),
                path: state_dir.join(account.as_str()),
                reason: "unreadable".to_string(),
            })
        }
    }

    fn supervisor() -> Supervisor {
        Supervisor::new(LoopContext {
            state_dir: std::env::temp_dir(),
            factory: Arc::new(NoStateFactory),
            registry: SessionRegistry::shared(),
            broadcaster: Arc::new(Broadcaster::new()),
            retry: crate::receiver::RetryPolicy::immediate(),
            link_check_interval: Duration::from_millis(5),
        })
    }

    fn wait_for_reap(supervisor: &Supervisor) -> Vec<(AccountId, LoopOutcome)> {
        for _ in 0..200 {
            let reaped = supervisor.reap_finished();
            if !reaped.is_empty() {
                return reaped;
            }
            thread::sleep(Duration::from_millis(5));
        }
        Vec::new()
    }

    #[test]
    fn test_rejects_unsafe_account_ids() {
        let supervisor = supervisor();
        let result = supervisor.spawn(AccountId::new("../escape"));
        assert!(matches!(result, Err(SetupError::InvalidAccount(_))));
    }

    #[test]
    fn test_setup_error_reaches_spawner() {
        let supervisor = supervisor();
        assert!(matches!(supervisor.spawn(AccountId::new("+15550000001")), Ok(true)));

        let reaped = wait_for_reap(&supervisor);
        assert_eq!(reaped.len(), 1);
        let (account, outcome) = &reaped[0];
        assert_eq!(account.as_str(), "+15550000001");
        assert!(matches!(outcome, Err(SetupError::MalformedState { .. })));
        assert!(supervisor.registry().is_empty());
        assert!(supervisor.running_accounts().is_empty());
    }
}
