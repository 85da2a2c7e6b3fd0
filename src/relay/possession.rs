//! # Possession Sessions
//!
//! A possession session pairs a ghost, who streams camera and movement input,
//! with a host whose client executes it. Each friend code takes part in at
//! most one live session, in one role.
//!
//! Sessions are indexed under both participants in one sharded map, so the
//! session for any friend code is a single lookup. A session is created by a
//! successful begin and destroyed by an explicit end, by either participant
//! disconnecting, or when the host reports that its state has diverged from
//! the ghost's input.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::codes::ResultCode;
use super::forward::ForwardedRequestManager;
use super::permissions::{ElevatedPermissions, PermissionSet};
use super::presence::Presence;
use super::protocol::{ActionPayload, Command, Method, PossessionBeginPayload, Response};
use super::sec_log;
use crate::logutil::redact_code;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Host,
    Ghost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub host: String,
    pub ghost: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(host: &str, ghost: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.to_string(),
            ghost: ghost.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn role_of(&self, friend_code: &str) -> Option<SessionRole> {
        if self.host == friend_code {
            Some(SessionRole::Host)
        } else if self.ghost == friend_code {
            Some(SessionRole::Ghost)
        } else {
            None
        }
    }

    /// The participant that is not `friend_code`.
    pub fn other(&self, friend_code: &str) -> &str {
        if self.host == friend_code {
            &self.ghost
        } else {
            &self.host
        }
    }
}

pub struct PossessionSessionManager {
    forward: Arc<ForwardedRequestManager>,
    sessions: DashMap<String, Arc<Session>>,
    timeout: Duration,
}

impl PossessionSessionManager {
    pub fn new(forward: Arc<ForwardedRequestManager>, timeout: Duration) -> Self {
        Self {
            forward,
            sessions: DashMap::new(),
            timeout,
        }
    }

    pub fn session_for(&self, friend_code: &str) -> Option<Arc<Session>> {
        self.sessions.get(friend_code).map(|s| Arc::clone(s.value()))
    }

    pub fn role_of(&self, friend_code: &str) -> Option<SessionRole> {
        self.session_for(friend_code)
            .and_then(|s| s.role_of(friend_code))
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len() / 2
    }

    /// Start a session with `ghost` possessing `host`.
    ///
    /// Exclusivity failures are reported as the response code. Failures tied
    /// to the host (offline, not friends, lacking permission, no reply) are
    /// reported in the results map and leave no session behind.
    pub async fn begin(&self, ghost: &str, host: &str, payload: PossessionBeginPayload) -> Response {
        let presence = match self.forward.admit_sender(ghost) {
            Ok(p) => p,
            Err(code) => return Response::rejected(code),
        };
        if let Err(code) = self.check_free(ghost, host) {
            return Response::rejected(code);
        }

        let required = PermissionSet::elevated(ElevatedPermissions::POSSESSION);
        let host_presence = match self.forward.check_target(ghost, host, &required).await {
            Ok(p) => p,
            Err(code) => return self.finish(&presence, host, code),
        };

        let session = match self.reserve(ghost, host) {
            Ok(s) => s,
            Err(code) => return Response::rejected(code),
        };

        let command = Command {
            sender_friend_code: ghost.to_string(),
            payload: ActionPayload::PossessionBegin(payload),
        };
        let reply = self
            .forward
            .invoke(&host_presence, Method::PossessionBegin, command, self.timeout)
            .await;

        if reply.result.is_success() {
            metrics::inc_possession_started();
            info!(
                "possession {} started: {} -> {}",
                session.id,
                redact_code(ghost),
                redact_code(host)
            );
        } else {
            self.release(&session);
            debug!(
                "possession {} rolled back, host replied {}",
                session.id, reply.result
            );
        }
        self.finish(&presence, host, reply.result)
    }

    /// Forward one camera or movement packet from the ghost to its host.
    pub async fn stream(&self, ghost: &str, payload: ActionPayload) -> Response {
        let method = payload.method();
        if !method.is_possession_stream() {
            return Response::rejected(ResultCode::BadDataInRequest);
        }
        let Some(presence) = self.forward.presences().try_get(ghost) else {
            sec_log!("possession stream from {} without a presence", redact_code(ghost));
            return Response::rejected(ResultCode::UnexpectedState);
        };
        let Some(session) = self.session_for(ghost) else {
            return Response::rejected(ResultCode::SenderNotInSession);
        };
        if session.ghost != ghost {
            sec_log!(
                "host {} tried to stream into session {}",
                redact_code(ghost),
                session.id
            );
            return Response::rejected(ResultCode::SenderNotGhost);
        }
        if let Err(reason) = presence.check_possession_limit() {
            sec_log!("rate limited {}: {}", redact_code(ghost), reason);
            metrics::inc_rate_limited();
            return Response::rejected(ResultCode::TooManyRequests);
        }

        let host = session.host.as_str();
        let Some(host_presence) = self.forward.presences().try_get(host) else {
            if self.release(&session) {
                metrics::inc_possession_ended();
                info!("possession {} ended, host went offline", session.id);
            }
            return self.finish(&presence, host, ResultCode::TargetOffline);
        };

        let command = Command {
            sender_friend_code: ghost.to_string(),
            payload,
        };
        let reply = self
            .forward
            .invoke(&host_presence, method, command, self.timeout)
            .await;

        if reply.result == ResultCode::PossessionDesynchronization && self.release(&session) {
            metrics::inc_possession_desync();
            sec_log!(
                "possession {} torn down: {} reported desynchronization",
                session.id,
                redact_code(host)
            );
        }
        self.finish(&presence, host, reply.result)
    }

    /// End the sender's session, from either side. Ending when no session
    /// exists succeeds with an empty results map.
    pub async fn end(&self, sender: &str) -> Response {
        let presence = match self.forward.admit_sender(sender) {
            Ok(p) => p,
            Err(code) => return Response::rejected(code),
        };
        match self.end_session(sender).await {
            Some((other, code)) => self.finish(&presence, &other, code),
            None => {
                presence.touch();
                Response::processed(HashMap::new())
            }
        }
    }

    /// Tear down whatever session `friend_code` is in after it disconnected.
    pub async fn end_for_disconnect(&self, friend_code: &str) -> Option<ResultCode> {
        self.end_session(friend_code).await.map(|(_, code)| code)
    }

    /// Remove the session `friend_code` is in and tell the other participant.
    /// Returns the other participant and the notification outcome.
    async fn end_session(&self, friend_code: &str) -> Option<(String, ResultCode)> {
        let session = self.session_for(friend_code)?;
        if !self.release(&session) {
            return None;
        }
        metrics::inc_possession_ended();
        info!("possession {} ended by {}", session.id, redact_code(friend_code));

        let other = session.other(friend_code).to_string();
        let code = match self.forward.presences().try_get(&other) {
            Some(p) => {
                let command = Command {
                    sender_friend_code: friend_code.to_string(),
                    payload: ActionPayload::PossessionEnd,
                };
                self.forward
                    .invoke(&p, Method::PossessionEnd, command, self.timeout)
                    .await
                    .result
            }
            None => ResultCode::TargetOffline,
        };
        Some((other, code))
    }

    fn check_free(&self, ghost: &str, host: &str) -> Result<(), ResultCode> {
        if self.sessions.contains_key(ghost) {
            sec_log!("{} is already in a possession session", redact_code(ghost));
            return Err(ResultCode::SenderAlreadyInSession);
        }
        if self.sessions.contains_key(host) {
            sec_log!("{} is already in a possession session", redact_code(host));
            return Err(ResultCode::TargetAlreadyInSession);
        }
        Ok(())
    }

    /// Claim both participants for a new session.
    ///
    /// Each entry guard is dropped before the next key is touched: two keys
    /// can share a shard.
    fn reserve(&self, ghost: &str, host: &str) -> Result<Arc<Session>, ResultCode> {
        let session = Arc::new(Session::new(host, ghost));
        match self.sessions.entry(ghost.to_string()) {
            Entry::Occupied(_) => return Err(ResultCode::SenderAlreadyInSession),
            Entry::Vacant(v) => {
                v.insert(Arc::clone(&session));
            }
        }
        let host_claimed = match self.sessions.entry(host.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Arc::clone(&session));
                true
            }
        };
        if !host_claimed {
            self.sessions.remove_if(ghost, |_, s| s.id == session.id);
            return Err(ResultCode::TargetAlreadyInSession);
        }
        Ok(session)
    }

    /// Drop both index entries of `session`. True for the caller that actually
    /// removed it, so concurrent teardowns are counted once.
    fn release(&self, session: &Session) -> bool {
        let ghost = self
            .sessions
            .remove_if(&session.ghost, |_, s| s.id == session.id)
            .is_some();
        let host = self
            .sessions
            .remove_if(&session.host, |_, s| s.id == session.id)
            .is_some();
        ghost || host
    }

    fn finish(&self, sender: &Presence, target: &str, code: ResultCode) -> Response {
        sender.touch();
        metrics::record_target_result(code);
        let mut results = HashMap::with_capacity(1);
        results.insert(target.to_string(), code);
        Response::processed(results)
    }
}
