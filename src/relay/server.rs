use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use super::body_swap::BodySwapCoordinator;
use super::connection::ConnectionHandle;
use super::forward::ForwardedRequestManager;
use super::handlers::{summarize, RequestRouter};
use super::permissions::{PermissionEdge, PermissionSet};
use super::possession::PossessionSessionManager;
use super::presence::{Presence, PresenceRegistry};
use super::rate_limit::RateLimitStats;
use super::protocol::{ActionPayload, OnlineStatusPayload, Request, Response};
use super::store::{PermissionStore, StoreError};
use crate::config::Config;
use crate::logutil::redact_code;
use crate::metrics;
use crate::validation::{validate_friend_code, ValidationError};

/// Errors from the relay's account-level operations. Request handling never
/// fails; its faults are result codes.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid friend code: {0}")]
    InvalidFriendCode(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Point-in-time view of the relay for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub online: usize,
    pub possession_sessions: usize,
    pub clients: Vec<ClientStatus>,
    pub metrics: metrics::Snapshot,
}

/// One online client as shown in status reports. The friend code is a
/// fingerprint, never the code itself.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub fingerprint: String,
    pub connected_at: DateTime<Utc>,
    pub idle_secs: i64,
    pub in_possession: bool,
    pub rate_limits: RateLimitStats,
}

/// # Relay Server
///
/// Owns the presence registry and the coordinators built on it, and exposes
/// the operations a transport calls: clients connect and disconnect, send
/// requests, and change their permissions. Online-status and permission
/// changes are pushed to affected friends as ordinary commands.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use friendrelay::config::Config;
/// use friendrelay::relay::{InMemoryPermissionStore, RelayServer};
///
/// let server = RelayServer::new(Config::default(), Arc::new(InMemoryPermissionStore::new()));
/// assert_eq!(server.status().online, 0);
/// ```
pub struct RelayServer {
    config: Config,
    store: Arc<dyn PermissionStore>,
    presences: Arc<PresenceRegistry>,
    forward: Arc<ForwardedRequestManager>,
    possession: Arc<PossessionSessionManager>,
    router: RequestRouter,
    started_at: DateTime<Utc>,
}

impl RelayServer {
    pub fn new(config: Config, store: Arc<dyn PermissionStore>) -> Self {
        let presences = Arc::new(PresenceRegistry::new());
        let forward = Arc::new(ForwardedRequestManager::new(
            Arc::clone(&presences),
            Arc::clone(&store),
            config.relay.forward_timeout(),
        ));
        let possession = Arc::new(PossessionSessionManager::new(
            Arc::clone(&forward),
            config.relay.possession_timeout(),
        ));
        let body_swap = Arc::new(BodySwapCoordinator::new(
            Arc::clone(&forward),
            config.relay.body_swap_query_timeout(),
        ));
        let router = RequestRouter::new(
            Arc::clone(&forward),
            Arc::clone(&possession),
            body_swap,
            config.relay.max_targets,
        );
        Self {
            config,
            store,
            presences,
            forward,
            possession,
            router,
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn presences(&self) -> &Arc<PresenceRegistry> {
        &self.presences
    }

    pub fn possession(&self) -> &Arc<PossessionSessionManager> {
        &self.possession
    }

    /// Register a client after its handshake.
    ///
    /// A presence already held by the same friend code is torn down first.
    /// Online mutual friends are told the client is back, and the edges the
    /// client has issued are returned for its friend list.
    pub async fn connect(
        &self,
        friend_code: &str,
        connection: Arc<dyn ConnectionHandle>,
        character_name: &str,
        character_world: &str,
    ) -> Result<Vec<PermissionEdge>, RelayError> {
        validate_friend_code(friend_code)?;
        let edges = self.store.get_all_permissions(friend_code).await?;

        if self.presences.is_online(friend_code) {
            info!("{} reconnected, replacing old presence", redact_code(friend_code));
            self.possession.end_for_disconnect(friend_code).await;
        }
        let presence = Presence::new(
            friend_code,
            connection,
            character_name,
            character_world,
            &self.config.rate_limit,
        );
        self.presences.add(presence);
        info!(
            "{} online ({} connected)",
            redact_code(friend_code),
            self.presences.online_count()
        );

        self.broadcast_status(friend_code, &edges, true).await;
        Ok(edges)
    }

    /// Drop a client's presence. Returns false when it was not online.
    pub async fn disconnect(&self, friend_code: &str) -> bool {
        if self.presences.remove(friend_code).is_none() {
            return false;
        }
        self.after_disconnect(friend_code).await;
        true
    }

    /// Drop a presence only if it still belongs to `connection_id`; a late
    /// close from a replaced connection is ignored.
    pub async fn disconnect_connection(&self, friend_code: &str, connection_id: &str) -> bool {
        if self
            .presences
            .remove_connection(friend_code, connection_id)
            .is_none()
        {
            debug!(
                "ignoring close of stale connection {} for {}",
                connection_id,
                redact_code(friend_code)
            );
            return false;
        }
        self.after_disconnect(friend_code).await;
        true
    }

    async fn after_disconnect(&self, friend_code: &str) {
        if let Some(code) = self.possession.end_for_disconnect(friend_code).await {
            debug!("possession end on disconnect notified: {}", code);
        }
        info!(
            "{} offline ({} connected)",
            redact_code(friend_code),
            self.presences.online_count()
        );
        match self.store.get_all_permissions(friend_code).await {
            Ok(edges) => self.broadcast_status(friend_code, &edges, false).await,
            Err(e) => warn!(
                "could not load friends of {} for offline notice: {}",
                redact_code(friend_code),
                e
            ),
        }
    }

    pub async fn handle_request(&self, sender: &str, request: Request) -> Response {
        let method = request.payload.method();
        let response = self.router.handle(sender, request).await;
        debug!(
            "{} from {}: {}",
            method,
            redact_code(sender),
            summarize(&response)
        );
        response
    }

    /// Store an edge and push it to its target when online.
    pub async fn update_permissions(&self, edge: PermissionEdge) -> Result<(), RelayError> {
        validate_friend_code(&edge.issuer)?;
        validate_friend_code(&edge.target)?;
        self.store.update_single_permissions(edge.clone()).await?;

        let issuer = edge.issuer.clone();
        let target = edge.target.clone();
        if self.presences.is_online(&target) {
            let code = self
                .forward
                .notify(&issuer, &target, ActionPayload::Permissions(edge))
                .await;
            debug!(
                "permission sync {} -> {}: {}",
                redact_code(&issuer),
                redact_code(&target),
                code
            );
        }
        Ok(())
    }

    /// Store new global defaults and push the affected edges to online mutual friends.
    pub async fn update_global_permissions(
        &self,
        friend_code: &str,
        permissions: PermissionSet,
    ) -> Result<(), RelayError> {
        validate_friend_code(friend_code)?;
        self.store
            .update_global_permissions(friend_code, permissions)
            .await?;
        let edges = self.store.get_all_permissions(friend_code).await?;
        let friends = self.online_mutual_friends(friend_code, &edges).await;
        let pending = friends.into_iter().map(|edge| async move {
            let target = edge.target.clone();
            let code = self
                .forward
                .notify(friend_code, &target, ActionPayload::Permissions(edge))
                .await;
            (target, code)
        });
        for (target, code) in join_all(pending).await {
            debug!("global permission sync to {}: {}", redact_code(&target), code);
        }
        Ok(())
    }

    pub fn status(&self) -> RelayStatus {
        let now = Utc::now();
        RelayStatus {
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            online: self.presences.online_count(),
            possession_sessions: self.possession.active_sessions(),
            clients: self
                .presences
                .online()
                .iter()
                .map(|p| ClientStatus {
                    fingerprint: redact_code(&p.friend_code),
                    connected_at: p.connected_at,
                    idle_secs: p.idle_secs(),
                    in_possession: self.possession.session_for(&p.friend_code).is_some(),
                    rate_limits: p.rate_limit_stats(),
                })
                .collect(),
            metrics: metrics::snapshot(),
        }
    }

    /// Edges from `friend_code` to friends that are online and have added
    /// `friend_code` back.
    async fn online_mutual_friends(
        &self,
        friend_code: &str,
        edges: &[PermissionEdge],
    ) -> Vec<PermissionEdge> {
        let mut mutual = Vec::new();
        for edge in edges {
            if !self.presences.is_online(&edge.target) {
                continue;
            }
            match self
                .store
                .get_single_permissions(&edge.target, friend_code)
                .await
            {
                Ok(Some(_)) => mutual.push(edge.clone()),
                Ok(None) => {}
                Err(e) => warn!(
                    "friend lookup {} -> {} failed: {}",
                    redact_code(&edge.target),
                    redact_code(friend_code),
                    e
                ),
            }
        }
        mutual
    }

    async fn broadcast_status(&self, friend_code: &str, edges: &[PermissionEdge], online: bool) {
        let friends = self.online_mutual_friends(friend_code, edges).await;
        if friends.is_empty() {
            return;
        }
        let pending = friends.into_iter().map(|edge| async move {
            let target = edge.target.clone();
            let payload = ActionPayload::OnlineStatus(OnlineStatusPayload {
                online,
                permissions: online.then_some(edge),
            });
            let code = self.forward.notify(friend_code, &target, payload).await;
            (target, code)
        });
        let outcomes = join_all(pending).await;
        let delivered = outcomes.iter().filter(|(_, c)| c.is_success()).count();
        debug!(
            "online status {} of {} sent to {}/{} friends",
            online,
            redact_code(friend_code),
            delivered,
            outcomes.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::loopback::LoopbackClient;
    use crate::relay::protocol::Method;
    use crate::relay::store::InMemoryPermissionStore;

    #[tokio::test]
    async fn connect_rejects_bad_friend_code() {
        let server = RelayServer::new(Config::default(), Arc::new(InMemoryPermissionStore::new()));
        let client = LoopbackClient::spawn("ok", "Name", "World");
        let err = server
            .connect("has space", Arc::new(client.connection()), "Name", "World")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidFriendCode(_)));
        assert_eq!(server.status().online, 0);
    }

    #[tokio::test]
    async fn status_lists_online_clients_by_fingerprint() {
        let server = RelayServer::new(Config::default(), Arc::new(InMemoryPermissionStore::new()));
        let b = LoopbackClient::spawn("B", "B Name", "World");
        let a = LoopbackClient::spawn("A", "A Name", "World");
        for client in [&b, &a] {
            server
                .connect(client.friend_code(), Arc::new(client.connection()), "Name", "World")
                .await
                .unwrap();
        }

        let status = server.status();
        assert_eq!(status.online, 2);
        let fingerprints: Vec<_> = status.clients.iter().map(|c| c.fingerprint.clone()).collect();
        assert_eq!(fingerprints, vec![redact_code("A"), redact_code("B")]);
        let first = &status.clients[0];
        assert!(!first.in_possession);
        assert_eq!(first.rate_limits.general_capacity, server.config().rate_limit.general_capacity);
        assert_eq!(first.rate_limits.general_available, first.rate_limits.general_capacity);
    }

    #[tokio::test]
    async fn self_edge_is_a_store_error() {
        let server = RelayServer::new(Config::default(), Arc::new(InMemoryPermissionStore::new()));
        let err = server
            .update_permissions(PermissionEdge::inherit("A", "A"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Store(StoreError::SelfEdge(_))));
    }

    #[tokio::test]
    async fn only_mutual_friends_hear_about_logins() {
        let store = Arc::new(InMemoryPermissionStore::new());
        let server = RelayServer::new(Config::default(), store.clone());
        let b = LoopbackClient::spawn("B", "Bee", "World");
        let c = LoopbackClient::spawn("C", "Cee", "World");
        server.connect("B", Arc::new(b.connection()), "Bee", "World").await.unwrap();
        server.connect("C", Arc::new(c.connection()), "Cee", "World").await.unwrap();

        // A and B are mutual friends; A added C but C never added A.
        for (issuer, target) in [("A", "B"), ("B", "A"), ("A", "C")] {
            store
                .update_single_permissions(PermissionEdge::inherit(issuer, target))
                .await
                .unwrap();
        }

        let a = LoopbackClient::spawn("A", "Ay", "World");
        let edges = server.connect("A", Arc::new(a.connection()), "Ay", "World").await.unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(b.received_count(Method::SyncOnlineStatus), 1);
        assert_eq!(c.received_count(Method::SyncOnlineStatus), 0);

        assert!(server.disconnect("A").await);
        assert!(!server.disconnect("A").await);
        let last = b.received().pop().unwrap();
        assert_eq!(last.0, Method::SyncOnlineStatus);
        assert_eq!(
            last.1.payload,
            ActionPayload::OnlineStatus(OnlineStatusPayload {
                online: false,
                permissions: None
            })
        );
    }
}
