//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming requests and answers them
//! - Subscribes the client to the [`Broadcaster`](crate::broadcast::Broadcaster) on request
//!
//! All outbound frames (responses and published messages) go through one
//! bounded queue per connection, drained by a writer task. Responses and
//! messages therefore reach the socket in the order they were queued, and
//! a stalled socket only ever blocks its own writer task.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()`, `panic!()` in this module. Connection
//! errors are logged and result in a graceful disconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::{AccountId, SetupError};
use relay_protocol::{error_code, ClientMessage, DaemonMessage, MessageType, VersionError};

use crate::broadcast::{ClientHandle, ClientId, Frame, CLIENT_QUEUE_CAPACITY};
use crate::supervisor::Supervisor;

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
pub const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handler for a single client.
pub struct ConnectionHandler {
    /// Buffered reader for incoming requests
    reader: BufReader<OwnedReadHalf>,

    /// Outbound queue, shared with the broadcaster while subscribed
    outbound: mpsc::Sender<Frame>,

    /// Drains `outbound` into the socket
    writer_task: JoinHandle<()>,

    supervisor: Arc<Supervisor>,

    /// Cancelled on server shutdown, on a failed write, or when the
    /// broadcaster gives up on this client
    cancel: CancellationToken,

    /// Unique client identifier (assigned after handshake)
    client_id: Option<ClientId>,

    /// Whether this client is subscribed to published messages
    subscribed: bool,

    connection_number: u64,
}

impl ConnectionHandler {
    /// Creates a handler and starts its writer task.
    ///
    /// `cancel` should be a child of the server's shutdown token.
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        supervisor: Arc<Supervisor>,
        cancel: CancellationToken,
        connection_number: u64,
    ) -> Self {
        let (outbound, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let writer_task = tokio::spawn(write_frames(
            BufWriter::new(writer),
            rx,
            cancel.clone(),
            connection_number,
        ));

        Self {
            reader: BufReader::new(reader),
            outbound,
            writer_task,
            supervisor,
            cancel,
            client_id: None,
            subscribed: false,
            connection_number,
        }
    }

    /// Runs the connection until it closes. Returns the client id if the
    /// handshake succeeded.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        let client_id = match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
                if let Err(e) = self.process_messages().await {
                    debug!(client_id = ?self.client_id, error = %e, "Connection closed");
                }
                info!(client_id = ?self.client_id, "Client disconnected");
                self.client_id.clone()
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                None
            }
        };

        self.unsubscribe();

        // Dropping the last sender lets the writer flush what is queued
        // and exit.
        let Self {
            outbound,
            writer_task,
            ..
        } = self;
        drop(outbound);
        if let Err(e) = writer_task.await {
            error!(error = %e, "Writer task failed");
        }

        client_id
    }

    /// Expects a `connect` message with a compatible protocol version and
    /// answers `connected`, `rejected` or `error`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match self.read_message().await {
            Ok(msg) => msg,
            Err(ConnectionError::ParseError(reason)) => {
                self.send_message(DaemonMessage::error_with_code(
                    &format!("Invalid handshake: {reason}"),
                    error_code::INVALID_MESSAGE,
                ))
                .await?;
                return Err(ConnectionError::ParseError(reason));
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = msg.protocol_version.check_against_current() {
            warn!(error = %e, "Protocol version mismatch");
            self.send_message(DaemonMessage::rejected(&e.to_string()))
                .await?;
            return Err(ConnectionError::Version(e));
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await
            }
            other => {
                self.send_message(DaemonMessage::error(
                    "Expected Connect message for handshake",
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads and answers requests until EOF, idle timeout, `disconnect`,
    /// or cancellation.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        let cancel = self.cancel.clone();

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(client_id = ?self.client_id, "Connection cancelled");
                    return Err(ConnectionError::Cancelled);
                }
                read = timeout(READ_TIMEOUT, self.read_message()) => read,
            };

            let msg = match read {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(reason))) => {
                    debug!(client_id = ?self.client_id, error = %reason, "Malformed request");
                    self.send_message(DaemonMessage::error_with_code(
                        &format!("Parse error: {reason}"),
                        error_code::INVALID_MESSAGE,
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e)) => {
                    let _ = self.send_message(DaemonMessage::error(&e.to_string())).await;
                    return Err(e);
                }
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            match self.handle_message(msg).await {
                Ok(()) => {}
                Err(ConnectionError::Eof) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Handles a single client request.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        if let Err(e) = msg.protocol_version.check_against_current() {
            return self.send_message(DaemonMessage::error(&e.to_string())).await;
        }

        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error("Already connected"))
                    .await?;
            }

            MessageType::Subscribe { account } => {
                self.handle_subscribe(account).await?;
            }

            MessageType::Unsubscribe => {
                self.unsubscribe();
                debug!(client_id = ?self.client_id, "Client unsubscribed");
            }

            MessageType::ListAccounts => {
                let accounts = self.supervisor.registry().accounts();
                self.send_message(DaemonMessage::account_list(accounts))
                    .await?;
            }

            MessageType::GetContact { account, address } => {
                let reply = match self.supervisor.registry().get(&account) {
                    Some(session) => {
                        let contact = session.get_contact(&address);
                        DaemonMessage::contact(account, contact)
                    }
                    None => DaemonMessage::error_with_code(
                        &format!("Account {account} has no initialized session"),
                        error_code::ACCOUNT_NOT_READY,
                    ),
                };
                self.send_message(reply).await?;
            }

            MessageType::AddAccount { account } => {
                let reply = match self.supervisor.spawn(account.clone()) {
                    Ok(started) => {
                        info!(
                            client_id = ?self.client_id,
                            account = %account,
                            started,
                            "Account added by client"
                        );
                        DaemonMessage::account_added(account)
                    }
                    Err(e @ SetupError::InvalidAccount(_)) => {
                        warn!(account = %account, error = %e, "Rejected account id");
                        DaemonMessage::error_with_code(&e.to_string(), error_code::INVALID_ACCOUNT)
                    }
                    Err(e) => {
                        error!(account = %account, error = %e, "Failed to add account");
                        DaemonMessage::error(&e.to_string())
                    }
                };
                self.send_message(reply).await?;
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    async fn handle_subscribe(&mut self, filter: Option<AccountId>) -> Result<(), ConnectionError> {
        let Some(client_id) = self.client_id.clone() else {
            return self
                .send_message(DaemonMessage::error("Must connect before subscribing"))
                .await;
        };

        let handle = ClientHandle {
            sender: self.outbound.clone(),
            filter: filter.clone(),
            disconnect: self.cancel.clone(),
        };

        match self.supervisor.broadcaster().add(client_id.clone(), handle) {
            Ok(()) => {
                self.subscribed = true;
                debug!(client_id = %client_id, filter = ?filter, "Client subscribed");

                // Current accounts as initial state
                let accounts = self.supervisor.registry().accounts();
                self.send_message(DaemonMessage::account_list(accounts))
                    .await
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Subscription refused");
                self.send_message(DaemonMessage::error_with_code(
                    &e.to_string(),
                    error_code::TOO_MANY_CLIENTS,
                ))
                .await
            }
        }
    }

    fn unsubscribe(&mut self) {
        if !self.subscribed {
            return;
        }
        if let Some(client_id) = &self.client_id {
            self.supervisor
                .broadcaster()
                .remove_if_current(client_id, &self.outbound);
        }
        self.subscribed = false;
    }

    /// Reads one newline-terminated request, bounded by `MAX_MESSAGE_SIZE`.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();
        let limit = (MAX_MESSAGE_SIZE + 1) as u64;

        let bytes_read = (&mut self.reader)
            .take(limit)
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    /// Queues a message for the writer task.
    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(&msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        match timeout(WRITE_TIMEOUT, self.outbound.send(Frame::from(json))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::Io("writer closed".to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    /// Returns the client ID (if connected).
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Writer task: drains the outbound queue into the socket.
///
/// Queued frames are flushed before honouring cancellation. A failed or
/// timed-out write cancels the connection.
async fn write_frames(
    mut writer: BufWriter<OwnedWriteHalf>,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    connection_number: u64,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let write = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };

        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection = connection_number, error = %e, "Write failed");
                cancel.cancel();
                break;
            }
            Err(_) => {
                warn!(connection = connection_number, "Write timed out, closing connection");
                cancel.cancel();
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: {0}")]
    Version(#[from] VersionError),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Connection cancelled")]
    Cancelled,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::ProtocolVersion;

    #[test]
    fn test_version_error_display() {
        let err = ConnectionError::from(VersionError::Incompatible {
            got: ProtocolVersion::new(2, 0),
            expected: ProtocolVersion::new(1, 0),
        });
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::MessageTooLarge {
            size: 2_000_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert!(err.to_string().contains("2000000"));
    }
}
