//! Relay Protocol - Wire protocol for daemon communication
//!
//! Newline-delimited JSON frames exchanged between relayd and its
//! local socket clients.

pub mod message;
pub mod version;

pub use message::{error_code, ClientMessage, DaemonMessage, MessageType};
pub use version::{ProtocolVersion, VersionError};
