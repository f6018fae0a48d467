//! Relay Core - Shared types for the messaging bridge
//!
//! This crate provides the domain types shared between the daemon
//! (relayd) and anything that talks to it, plus the contract a
//! messaging backend has to fulfil (`Session`).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod account;
pub mod contact;
pub mod error;
pub mod event;
pub mod message;
pub mod session;

// Re-exports for convenience
pub use account::AccountId;
pub use contact::ContactInfo;
pub use error::{NormalizeError, ReceiveError, SetupError};
pub use event::{
    Address, Content, DecodeError, Envelope, EnvelopeKind, InboundEvent, ReceiptKind,
    TypingAction,
};
pub use message::{ContentKind, NormalizedMessage};
pub use session::{
    EventHandler, Session, SessionFactory, SharedSession, DEFAULT_RECEIVE_TIMEOUT,
};
