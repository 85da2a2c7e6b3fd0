//! # Relay Core
//!
//! Presence tracking, permission resolution and command forwarding between
//! mutually opted-in clients.
//!
//! ## Layers
//!
//! - [`rate_limit`] - per-connection token buckets
//! - [`presence`] - online clients and their connection handles
//! - [`permissions`] - capability flags and the pure resolver
//! - [`forward`] - the standard fan-out path every action takes
//! - [`possession`] - exclusive host/ghost sessions and the input stream
//! - [`body_swap`] - all-or-nothing identity query plus derangement
//! - [`handlers`] - per-method validation and routing
//! - [`server`] - the [`RelayServer`] façade tying the pieces together
//!
//! The relay never trusts either side: every command is re-checked against the
//! target's current permission edge toward the sender at delivery time.

// Security-relevant events go to the `security` log target so they can be
// routed to their own file.
macro_rules! sec_log {
    ($($arg:tt)*) => { log::warn!(target: "security", $($arg)*); };
}
pub(crate) use sec_log;

pub mod body_swap;
pub mod codes;
pub mod connection;
pub mod forward;
pub mod handlers;
pub mod loopback;
pub mod permissions;
pub mod possession;
pub mod presence;
pub mod protocol;
pub mod rate_limit;
pub mod server;
pub mod store;

pub use codes::ResultCode;
pub use connection::{ChannelConnection, ConnectionHandle, OutboundCommand, TransportError};
pub use forward::ForwardedRequestManager;
pub use loopback::{LoopbackClient, LoopbackScript};
pub use permissions::{
    ElevatedPermissions, PermissionEdge, PermissionSet, PermissionValue, PrimaryPermissions,
    SpeakPermissions,
};
pub use presence::{Presence, PresenceRegistry};
pub use protocol::{ActionPayload, ActionResult, Command, Method, Request, Response};
pub use server::{ClientStatus, RelayError, RelayServer, RelayStatus};
pub use store::{InMemoryPermissionStore, PermissionStore, StoreError};
