//! # Friendrelay - Permissioned Command Relay Between Friends
//!
//! Friendrelay is the core of a relay that lets pairs of mutually opted-in
//! clients send each other appearance and behaviour commands (speak, emote,
//! transform, twinning, body swap, hypnosis, possession). The relay trusts
//! neither side: every command is checked against the target's current,
//! per-capability grants toward the sender before it is delivered.
//!
//! ## Features
//!
//! - **Presence tracking**: one presence per online friend code, each with its
//!   own general and possession-stream token buckets.
//! - **Three-valued permissions**: per-capability allow / deny / inherit over
//!   global defaults, resolved fresh for every request.
//! - **Fan-out forwarding**: concurrent per-target delivery with deadlines and
//!   per-target failure isolation.
//! - **Possession sessions**: exclusive host/ghost pairs with a high-rate
//!   input stream and desync teardown.
//! - **Body swaps**: an all-or-nothing query phase followed by a derangement
//!   of the participants' identities.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use friendrelay::config::Config;
//! use friendrelay::relay::{InMemoryPermissionStore, LoopbackClient, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("relay.toml").await?;
//!     let server = RelayServer::new(config, Arc::new(InMemoryPermissionStore::new()));
//!
//!     let client = LoopbackClient::spawn("FRIEND-1", "Some Name", "Some World");
//!     server
//!         .connect("FRIEND-1", Arc::new(client.connection()), "Some Name", "Some World")
//!         .await?;
//!     println!("{} online", server.status().online);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`relay`] - Presence, permissions, forwarding and the session coordinators
//! - [`config`] - Configuration management and validation
//! - [`validation`] - Friend code, target list and payload validation
//! - [`logutil`] - Log redaction and escaping helpers
//! - [`metrics`] - Process-wide counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Relay Server   │ ← connect / disconnect / requests / permission updates
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Possession and  │ ← session state, derangement, shared cancellation
//! │ Body Swap       │
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Forwarding      │ ← admission, permission checks, timed fan-out
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Presence and    │ ← online clients, buckets, connection handles
//! │ Permission Store│
//! └─────────────────┘
//! ```

pub mod config;
pub mod logutil;
pub mod metrics;
pub mod relay;
pub mod validation;
