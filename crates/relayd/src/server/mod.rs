//! Unix socket server for the relay daemon.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│   Supervisor    │
//! │   (per client)  │     │ registry, loops │
//! └───────┬─────────┘     └─────────────────┘
//!         │ subscribe
//!         ▼
//! ┌─────────────────┐
//! │   Broadcaster   │
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the server keeps accepting

mod connection;

pub use connection::{
    ConnectionError, ConnectionHandler, MAX_MESSAGE_SIZE, READ_TIMEOUT, WRITE_TIMEOUT,
};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::supervisor::Supervisor;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/relayd.sock";

/// Unix socket server for the relay daemon.
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,

    /// Receive loops, registry and broadcaster
    supervisor: Arc<Supervisor>,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Connection counter for generating client IDs
    connection_counter: AtomicU64,
}

impl DaemonServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        supervisor: Arc<Supervisor>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            supervisor,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs the server until the cancellation token is triggered.
    ///
    /// # Errors
    ///
    /// `ServerError::SocketSetup` if the socket cannot be bound.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;

        info!(socket = %self.socket_path.display(), "Daemon server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    /// Replaces any stale socket file and binds the listener.
    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_error)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }

        UnixListener::bind(&self.socket_path).map_err(setup_error)
    }

    fn handle_connection(&self, stream: UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            reader,
            writer,
            Arc::clone(&self.supervisor),
            self.cancel_token.child_token(),
            connection_number,
        );

        tokio::spawn(async move {
            let client_id = handler.run().await;
            debug!(
                connection = connection_number,
                client_id = ?client_id,
                "Connection task finished"
            );
        });
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Server cleanup complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
