//! # tabrelay-daemon
//!
//! The relay runtime: the hub that owns extension sessions and correlates
//! command responses, the HTTP/WebSocket surface agents and extensions talk
//! to, the ephemeral screenshot store, and the `tabrelay` CLI.
//!
//! Process-wide state (the session registry and the pending-request table,
//! both inside [`hub::Hub`]) is constructed explicitly in `serve` and drained
//! explicitly at shutdown; nothing is module-initialized.

#![warn(clippy::all)]

pub mod auth;
pub mod cli;
pub mod handlers;
pub mod hub;
pub mod screenshots;
pub mod server;

/// Relay version reported in handshakes and `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
