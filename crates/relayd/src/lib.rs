//! relay daemon - account receive loops, session registry and broadcast server
//!
//! This crate provides the daemon's moving parts:
//! - `supervisor` - spawns one receive loop thread per account
//! - `receiver` - the per-account blocking receive loop and retry policy
//! - `registry` - concurrent map of live sessions
//! - `broadcast` - non-blocking fan-out of normalized messages to clients
//! - `server` - Unix socket server for client connections
//! - `spool` - file-backed session backend
//! - `config` - TOML configuration with environment overrides
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          relayd daemon                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────────┐  put    ┌──────────────────┐               │
//! │  │ AccountReceive-  │────────▶│ SessionRegistry  │◀──────┐       │
//! │  │ Loop (1 thread   │         └──────────────────┘       │ get   │
//! │  │ per account)     │                                    │       │
//! │  └────────┬─────────┘                           ┌────────┴─────┐ │
//! │           │ publish                             │ DaemonServer │ │
//! │           ▼                                     │ (Unix socket)│ │
//! │  ┌──────────────────┐  add / remove             └────────┬─────┘ │
//! │  │   Broadcaster    │◀───────────────────────────────────┘       │
//! │  └────────┬─────────┘                                            │
//! │           │ per-client queues                                    │
//! │           ▼                                                      │
//! │     socket clients                                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows a panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod broadcast;
pub mod config;
pub mod receiver;
pub mod registry;
pub mod server;
pub mod spool;
pub mod supervisor;
