//! # Forwarded Request Manager
//!
//! The standard path every relayed action takes:
//!
//! 1. **Admission** - the sender must be online and have a token in its
//!    general bucket. A rejected sender causes no side effects at all.
//! 2. **Per-target work**, concurrently and independently for each target:
//!    presence lookup, permission resolution against the target's edge toward
//!    the sender, then a deadline-bounded remote call.
//! 3. **Join** - all per-target outcomes are collected into the results map.
//!
//! Targets never share cancellation: one target timing out or faulting only
//! affects its own entry in the results map.

use futures::future::join_all;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::codes::ResultCode;
use super::connection::invoke_with_deadline;
use super::permissions::{resolve, PermissionSet};
use super::presence::{Presence, PresenceRegistry};
use super::protocol::{ActionPayload, ActionResult, Command, Method, Response};
use super::sec_log;
use super::store::PermissionStore;
use crate::logutil::redact_code;
use crate::metrics;

pub struct ForwardedRequestManager {
    presences: Arc<PresenceRegistry>,
    store: Arc<dyn PermissionStore>,
    forward_timeout: Duration,
}

impl ForwardedRequestManager {
    pub fn new(
        presences: Arc<PresenceRegistry>,
        store: Arc<dyn PermissionStore>,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            presences,
            store,
            forward_timeout,
        }
    }

    pub fn presences(&self) -> &Arc<PresenceRegistry> {
        &self.presences
    }

    pub fn forward_timeout(&self) -> Duration {
        self.forward_timeout
    }

    /// Sender presence and general rate limit, checked before any network activity.
    pub fn admit_sender(&self, sender: &str) -> Result<Arc<Presence>, ResultCode> {
        let presence = match self.presences.try_get(sender) {
            Some(p) => p,
            None => {
                sec_log!("request from {} without a presence", redact_code(sender));
                return Err(ResultCode::UnexpectedState);
            }
        };
        if let Err(reason) = presence.check_general_limit() {
            sec_log!("rate limited {}: {}", redact_code(sender), reason);
            metrics::inc_rate_limited();
            return Err(ResultCode::TooManyRequests);
        }
        Ok(presence)
    }

    /// Admit the sender, then deliver `payload` to every target it may reach.
    ///
    /// The response code is `Success` whenever the batch was accepted; the
    /// fate of each target is in the results map.
    pub async fn check_permissions_and_send(
        &self,
        sender: &str,
        targets: &[String],
        method: Method,
        required: PermissionSet,
        payload: ActionPayload,
    ) -> Response {
        let presence = match self.admit_sender(sender) {
            Ok(p) => p,
            Err(code) => return Response::rejected(code),
        };
        let deliveries = targets
            .iter()
            .map(|t| (t.clone(), payload.clone()))
            .collect();
        let results = self.send_each(&presence, deliveries, method, required).await;
        Response::processed(results)
    }

    /// Deliver one tailored payload per target for an already admitted sender.
    pub async fn send_each(
        &self,
        sender: &Presence,
        deliveries: Vec<(String, ActionPayload)>,
        method: Method,
        required: PermissionSet,
    ) -> HashMap<String, ResultCode> {
        let sender_code = sender.friend_code.as_str();
        let pending = deliveries.into_iter().map(|(target, payload)| async move {
            let code = self
                .forward_to_target(sender_code, &target, method, required, payload)
                .await;
            (target, code)
        });
        let results: HashMap<String, ResultCode> = join_all(pending).await.into_iter().collect();

        sender.touch();
        for code in results.values() {
            metrics::record_target_result(*code);
        }
        info!(
            "{} from {} to {} target(s): {} delivered",
            method,
            redact_code(sender_code),
            results.len(),
            results.values().filter(|c| c.is_success()).count()
        );
        results
    }

    /// Presence and permission checks for one target, without contacting it.
    pub async fn check_target(
        &self,
        sender: &str,
        target: &str,
        required: &PermissionSet,
    ) -> Result<Arc<Presence>, ResultCode> {
        let presence = self.presences.try_get(target).ok_or(ResultCode::TargetOffline)?;

        let edge = match self.store.get_single_permissions(target, sender).await {
            Ok(Some(edge)) => edge,
            Ok(None) => return Err(ResultCode::TargetNotFriends),
            Err(e) => {
                log::error!(
                    "permission lookup {} -> {} failed: {}",
                    redact_code(target),
                    redact_code(sender),
                    e
                );
                return Err(ResultCode::Unknown);
            }
        };
        let global = match self.store.get_global_permissions(target).await {
            Ok(global) => global.unwrap_or_default(),
            Err(e) => {
                log::error!("global permission lookup {} failed: {}", redact_code(target), e);
                return Err(ResultCode::Unknown);
            }
        };

        let resolved = resolve(&global, &edge);
        if !resolved.satisfies(required) {
            sec_log!(
                "{} lacks {} from {}",
                redact_code(sender),
                resolved.missing(required).describe(),
                redact_code(target)
            );
            return Err(ResultCode::TargetLacksPermissions);
        }
        Ok(presence)
    }

    /// Send a command to a target that already passed its checks.
    pub async fn invoke(
        &self,
        target: &Presence,
        method: Method,
        command: Command,
        deadline: Duration,
    ) -> ActionResult {
        invoke_with_deadline(
            target.connection.as_ref(),
            &target.friend_code,
            method,
            command,
            deadline,
        )
        .await
    }

    /// The full per-target path: checks, then the deadline-bounded call.
    pub async fn forward_to_target(
        &self,
        sender: &str,
        target: &str,
        method: Method,
        required: PermissionSet,
        payload: ActionPayload,
    ) -> ResultCode {
        let presence = match self.check_target(sender, target, &required).await {
            Ok(p) => p,
            Err(code) => return code,
        };
        let command = Command {
            sender_friend_code: sender.to_string(),
            payload,
        };
        self.invoke(&presence, method, command, self.forward_timeout)
            .await
            .result
    }

    /// Relay-originated notification: no permission check, offline targets skipped.
    pub async fn notify(&self, sender: &str, target: &str, payload: ActionPayload) -> ResultCode {
        let Some(presence) = self.presences.try_get(target) else {
            return ResultCode::TargetOffline;
        };
        let method = payload.method();
        let command = Command {
            sender_friend_code: sender.to_string(),
            payload,
        };
        let code = self
            .invoke(&presence, method, command, self.forward_timeout)
            .await
            .result;
        debug!("{} notification to {}: {}", method, redact_code(target), code);
        code
    }
}
