//! Spool-directory session backend.
//!
//! Implements [`Session`] over plain files in the state directory, so the
//! daemon can run end to end without a remote protocol implementation:
//!
//! ```text
//! <state_dir>/
//! ├── +15551234567              account file (JSON)
//! └── +15551234567.d/
//!     └── inbox/
//!         ├── 0001.json         one InboundEvent per file,
//!         └── 0002.json         delivered in file-name order
//! ```
//!
//! The account file holds `{"username", "uuid"?, "registered", "contacts"}`.
//! Setting `registered` to `false` while the daemon runs revokes the
//! account: the next receive call fails with `Authorization`.
//!
//! All functions here perform blocking file I/O; they are only called from
//! receive loop threads.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, trace};

use relay_core::{
    AccountId, ContactInfo, DecodeError, Envelope, EventHandler, InboundEvent, ReceiveError,
    Session, SessionFactory, SetupError, SharedSession,
};

/// How often an idle inbox is re-scanned.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Emits a protocol-layer diagnostic under the `protocol` target.
pub fn protocol_log(tag: &str, message: &str) {
    debug!(target: "protocol", "[{tag}] {message}");
}

/// Lists the accounts that have an account file in `state_dir`.
///
/// # Errors
///
/// Any error reading the directory itself.
pub fn list_accounts(state_dir: &Path) -> io::Result<Vec<AccountId>> {
    let mut accounts = Vec::new();
    for entry in fs::read_dir(state_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().is_some() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let account = AccountId::new(name);
        if !name.starts_with('.') && account.is_path_safe() {
            accounts.push(account);
        }
    }
    accounts.sort();
    Ok(accounts)
}

// ============================================================================
// Account File
// ============================================================================

fn default_registered() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct AccountState {
    username: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default = "default_registered")]
    registered: bool,
    #[serde(default)]
    contacts: Vec<ContactInfo>,
}

fn read_account_state(path: &Path) -> Result<AccountState, String> {
    let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}

// ============================================================================
// Factory
// ============================================================================

/// Creates [`SpoolSession`]s.
#[derive(Debug, Clone)]
pub struct SpoolSessionFactory {
    poll_interval: Duration,
}

impl Default for SpoolSessionFactory {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl SpoolSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl SessionFactory for SpoolSessionFactory {
    fn create(&self, account: &AccountId, state_dir: &Path) -> Result<SharedSession, SetupError> {
        if !account.is_path_safe() {
            return Err(SetupError::InvalidAccount(account.as_str().to_string()));
        }

        let meta = fs::metadata(state_dir).map_err(|e| SetupError::StateDir {
            path: state_dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !meta.is_dir() {
            return Err(SetupError::StateDir {
                path: state_dir.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        Ok(Arc::new(SpoolSession::new(
            account.clone(),
            state_dir,
            self.poll_interval,
        )))
    }
}

// ============================================================================
// Session
// ============================================================================

/// A session whose "remote" is an inbox directory.
pub struct SpoolSession {
    account: AccountId,
    account_file: PathBuf,
    inbox: PathBuf,
    poll_interval: Duration,
    contacts: RwLock<Vec<ContactInfo>>,
}

impl SpoolSession {
    pub fn new(account: AccountId, state_dir: &Path, poll_interval: Duration) -> Self {
        let account_file = state_dir.join(account.as_str());
        let inbox = state_dir
            .join(format!("{}.d", account.as_str()))
            .join("inbox");
        Self {
            account,
            account_file,
            inbox,
            poll_interval,
            contacts: RwLock::new(Vec::new()),
        }
    }

    /// Directory new event files are dropped into.
    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    fn check_authorized(&self) -> Result<(), ReceiveError> {
        if !self.account_file.exists() {
            // Not linked yet: nothing to revoke.
            return Ok(());
        }
        match read_account_state(&self.account_file) {
            Ok(state) if state.registered => Ok(()),
            Ok(_) => Err(ReceiveError::Authorization(format!(
                "account {} is no longer registered",
                self.account
            ))),
            Err(reason) => Err(ReceiveError::ProtocolAssertion(format!(
                "account file unreadable: {reason}"
            ))),
        }
    }

    /// Delivers every queued event file. Returns how many were delivered.
    fn drain_inbox(&self, handler: &mut dyn EventHandler) -> Result<usize, ReceiveError> {
        let entries = match fs::read_dir(&self.inbox) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut delivered = 0;
        for path in files {
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            trace!(account = %self.account, file = %path.display(), "Delivering spooled event");
            handler.handle_event(decode_event(&path, &raw));
            delivered += 1;

            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(delivered)
    }
}

/// Parses one spool file. A file that is not a valid event still yields an
/// event, carrying the decode error and whatever envelope could be read.
fn decode_event(path: &Path, raw: &str) -> InboundEvent {
    match serde_json::from_str::<InboundEvent>(raw) {
        Ok(event) => event,
        Err(e) => {
            let envelope = serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .and_then(|value| value.get("envelope").cloned())
                .and_then(|value| serde_json::from_value::<Envelope>(value).ok());
            InboundEvent::failed(
                envelope,
                DecodeError::new(format!("{}: {e}", path.display())),
            )
        }
    }
}

impl Session for SpoolSession {
    fn exists(&self) -> bool {
        self.account_file.is_file()
    }

    fn initialize(&self) -> Result<(), SetupError> {
        let state =
            read_account_state(&self.account_file).map_err(|reason| SetupError::MalformedState {
                account: self.account.clone(),
                path: self.account_file.clone(),
                reason,
            })?;

        fs::create_dir_all(&self.inbox).map_err(|e| SetupError::StateDir {
            path: self.inbox.clone(),
            reason: e.to_string(),
        })?;

        protocol_log(
            "spool",
            &format!(
                "loaded {} as {} (uuid {:?}) with {} contacts",
                self.account,
                state.username,
                state.uuid,
                state.contacts.len()
            ),
        );
        *self.contacts.write() = state.contacts;
        Ok(())
    }

    fn get_contact(&self, address: &str) -> Option<ContactInfo> {
        self.contacts
            .read()
            .iter()
            .find(|contact| contact.matches(address))
            .cloned()
    }

    fn receive_blocking(
        &self,
        timeout: Duration,
        return_on_timeout: bool,
        skip_attachments: bool,
        handler: &mut dyn EventHandler,
    ) -> Result<(), ReceiveError> {
        if skip_attachments {
            protocol_log("spool", "attachments are never fetched by this backend");
        }

        let mut deadline = Instant::now() + timeout;
        loop {
            self.check_authorized()?;
            self.drain_inbox(handler)?;

            let now = Instant::now();
            if now >= deadline {
                if return_on_timeout {
                    return Ok(());
                }
                deadline = now + timeout;
            }
            thread::sleep(self.poll_interval.min(deadline.saturating_duration_since(now)));
        }
    }
}
