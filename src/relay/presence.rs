//! # Presence Registry
//!
//! Tracks which friend codes are online and how to reach them. A presence is
//! created when a client completes its connection handshake and destroyed on
//! disconnect or logout; there is at most one presence per friend code.
//!
//! The registry is shared by every handler task, so it is a sharded
//! [`DashMap`]: lookups and updates for different friend codes never contend
//! on a single lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use super::connection::ConnectionHandle;
use super::rate_limit::{RateLimitReason, RateLimitStats, RateLimiter};
use crate::config::RateLimitConfig;
use crate::logutil::redact_code;

/// One online client.
pub struct Presence {
    pub friend_code: String,
    pub connection: Arc<dyn ConnectionHandle>,
    pub character_name: String,
    pub character_world: String,
    pub connected_at: DateTime<Utc>,
    limiter: RateLimiter,
    last_action: Mutex<DateTime<Utc>>,
}

impl Presence {
    pub fn new(
        friend_code: impl Into<String>,
        connection: Arc<dyn ConnectionHandle>,
        character_name: impl Into<String>,
        character_world: impl Into<String>,
        rate_limits: &RateLimitConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            friend_code: friend_code.into(),
            connection,
            character_name: character_name.into(),
            character_world: character_world.into(),
            connected_at: now,
            limiter: RateLimiter::new(rate_limits),
            last_action: Mutex::new(now),
        }
    }

    pub fn last_action_time(&self) -> DateTime<Utc> {
        *self.last_action.lock()
    }

    /// Update the last action timestamp
    pub fn touch(&self) {
        *self.last_action.lock() = Utc::now();
    }

    pub fn check_general_limit(&self) -> Result<(), RateLimitReason> {
        self.limiter.check_general()
    }

    pub fn check_possession_limit(&self) -> Result<(), RateLimitReason> {
        self.limiter.check_possession()
    }

    pub fn rate_limit_stats(&self) -> RateLimitStats {
        self.limiter.stats()
    }

    /// Whole seconds since the last accepted request.
    pub fn idle_secs(&self) -> i64 {
        (Utc::now() - self.last_action_time()).num_seconds().max(0)
    }
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Presence")
            .field("friend_code", &redact_code(&self.friend_code))
            .field("connection", &self.connection.connection_id())
            .field("character_name", &self.character_name)
            .field("character_world", &self.character_world)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// Online clients keyed by friend code.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    presences: DashMap<String, Arc<Presence>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a presence under its own friend code, returning the one it
    /// replaced, if any.
    pub fn add(&self, presence: Presence) -> Option<Arc<Presence>> {
        debug!(
            "presence add {} via {}",
            redact_code(&presence.friend_code),
            presence.connection.connection_id()
        );
        self.presences
            .insert(presence.friend_code.clone(), Arc::new(presence))
    }

    pub fn remove(&self, friend_code: &str) -> Option<Arc<Presence>> {
        let removed = self.presences.remove(friend_code).map(|(_, p)| p);
        if removed.is_some() {
            debug!("presence remove {}", redact_code(friend_code));
        }
        removed
    }

    /// Remove the presence only if it still belongs to `connection_id`.
    ///
    /// A connection that closes after its client has already reconnected must
    /// not evict the newer presence.
    pub fn remove_connection(&self, friend_code: &str, connection_id: &str) -> Option<Arc<Presence>> {
        self.presences
            .remove_if(friend_code, |_, p| p.connection.connection_id() == connection_id)
            .map(|(_, p)| p)
    }

    pub fn try_get(&self, friend_code: &str) -> Option<Arc<Presence>> {
        self.presences.get(friend_code).map(|p| Arc::clone(p.value()))
    }

    pub fn is_online(&self, friend_code: &str) -> bool {
        self.presences.contains_key(friend_code)
    }

    /// Take a token from the client's general bucket. True when the client is
    /// over its limit or not online.
    pub fn is_exceeding_general_limit(&self, friend_code: &str) -> bool {
        match self.presences.get(friend_code) {
            Some(p) => p.check_general_limit().is_err(),
            None => true,
        }
    }

    /// Take a token from the client's possession stream bucket.
    pub fn is_exceeding_possession_limit(&self, friend_code: &str) -> bool {
        match self.presences.get(friend_code) {
            Some(p) => p.check_possession_limit().is_err(),
            None => true,
        }
    }

    pub fn online_count(&self) -> usize {
        self.presences.len()
    }

    /// Every online presence, ordered by friend code.
    pub fn online(&self) -> Vec<Arc<Presence>> {
        let mut online: Vec<Arc<Presence>> =
            self.presences.iter().map(|p| Arc::clone(p.value())).collect();
        online.sort_by(|a, b| a.friend_code.cmp(&b.friend_code));
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::connection::ChannelConnection;

    fn limits(general: u32) -> RateLimitConfig {
        RateLimitConfig {
            general_capacity: general,
            general_refill_interval_ms: 60_000,
            possession_capacity: 1,
            possession_refill_interval_ms: 60_000,
        }
    }

    fn presence(code: &str, general: u32) -> (Presence, String) {
        let (conn, _rx) = ChannelConnection::new();
        let id = conn.connection_id().to_string();
        (
            Presence::new(code, Arc::new(conn), "Some Name", "World", &limits(general)),
            id,
        )
    }

    #[test]
    fn add_replaces_and_remove_clears() {
        let reg = PresenceRegistry::new();
        let (p1, _) = presence("A", 1);
        let (p2, id2) = presence("A", 1);
        assert!(reg.add(p1).is_none());
        assert!(reg.add(p2).is_some());
        assert_eq!(reg.online_count(), 1);
        assert_eq!(reg.try_get("A").unwrap().connection.connection_id(), id2);
        assert!(reg.remove("A").is_some());
        assert!(reg.try_get("A").is_none());
        assert!(reg.remove("A").is_none());
    }

    #[test]
    fn add_keys_on_the_presence_friend_code() {
        let reg = PresenceRegistry::new();
        let (b, _) = presence("B", 1);
        let (a, _) = presence("A", 1);
        reg.add(b);
        reg.add(a);
        assert!(reg.is_online("A") && reg.is_online("B"));
        let codes: Vec<_> = reg.online().iter().map(|p| p.friend_code.clone()).collect();
        assert_eq!(codes, vec!["A", "B"]);
    }

    #[test]
    fn stale_connection_does_not_evict_newer_presence() {
        let reg = PresenceRegistry::new();
        let (old, old_id) = presence("A", 1);
        let (new, new_id) = presence("A", 1);
        reg.add(old);
        reg.add(new);
        assert!(reg.remove_connection("A", &old_id).is_none());
        assert!(reg.is_online("A"));
        assert!(reg.remove_connection("A", &new_id).is_some());
        assert!(!reg.is_online("A"));
    }

    #[test]
    fn limit_checks_consume_tokens() {
        let reg = PresenceRegistry::new();
        let (p, _) = presence("A", 2);
        reg.add(p);
        assert!(!reg.is_exceeding_general_limit("A"));
        assert!(!reg.is_exceeding_general_limit("A"));
        assert!(reg.is_exceeding_general_limit("A"));
        assert!(!reg.is_exceeding_possession_limit("A"));
        assert!(reg.is_exceeding_possession_limit("A"));
        assert!(reg.is_exceeding_general_limit("missing"));
    }

    #[test]
    fn touch_moves_last_action_forward() {
        let (p, _) = presence("A", 1);
        let before = p.last_action_time();
        std::thread::sleep(std::time::Duration::from_millis(5));
        p.touch();
        assert!(p.last_action_time() > before);
        assert_eq!(p.idle_secs(), 0);
    }
}
