//! # tabrelay-core
//!
//! Core library for tabrelay, a self-hosted relay that bridges programmatic
//! API callers to live browser sessions over a persistent WebSocket
//! connection.
//!
//! This crate holds the pieces that do not depend on a running server:
//!
//! - **Token store**: issuance, SHA-256 digesting, validation, and revocation
//!   of bearer tokens backed by a single SQLite table
//! - **Rate limiter**: fixed-window per-token request budgeting
//! - **Wire protocol**: the tagged JSON message schema spoken on the duplex
//!   socket between the relay and the browser extension
//! - **Configuration**: environment-backed runtime configuration
//!
//! The daemon crate (`tabrelay-daemon`) builds the hub, HTTP surface, and CLI
//! on top of these.

#![warn(clippy::all)]

pub mod config;
pub mod protocol;
pub mod ratelimit;
pub mod token;

pub use config::Config;
pub use ratelimit::{Decision, RateLimiter};
pub use token::{Token, TokenStore, TokenStoreError};
