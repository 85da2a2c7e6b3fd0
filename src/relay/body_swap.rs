//! # Body Swap Coordinator
//!
//! A body swap reassigns the participants' character identities so that no
//! participant keeps its own. It runs in three phases:
//!
//! 1. **Query** - every target is checked and asked for its current identity,
//!    concurrently, under one shared [`CancellationToken`] and one overall
//!    deadline. The first failure cancels the remaining queries and aborts the
//!    swap before anything is delivered.
//! 2. **Assignment** - a derangement of the collected identities.
//! 3. **Delivery** - one tailored command per target through the standard
//!    forwarding path, where targets fail independently again.

use futures::future::join_all;
use log::{debug, info};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::codes::ResultCode;
use super::forward::ForwardedRequestManager;
use super::permissions::PermissionSet;
use super::protocol::{
    ActionPayload, BodySwapAssignment, BodySwapPayload, CharacterIdentity, Command, Method,
    ReplyPayload, Response, ResponsePayload,
};
use super::sec_log;
use crate::logutil::redact_code;
use crate::metrics;

/// A permutation of `0..n` with no fixed point: `perm[i] != i` for every `i`
/// when `n >= 2`. Shorter inputs are returned unchanged.
///
/// A forward Fisher-Yates pass over `[0, n-1)` where slot `i` draws from the
/// not-yet-placed values other than `i` itself. The last slot takes whatever
/// remains; when that is its own index it trades places with one uniformly
/// chosen earlier slot.
pub fn derangement<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..n).collect();
    if n < 2 {
        return perm;
    }
    if n == 2 {
        perm.swap(0, 1);
        return perm;
    }
    // pos[v] is the slot currently holding value v.
    let mut pos: Vec<usize> = (0..n).collect();
    for i in 0..n - 1 {
        let own = Some(pos[i]).filter(|&p| p >= i);
        let span = n - i - usize::from(own.is_some());
        let mut j = i + rng.gen_range(0..span);
        if let Some(p) = own {
            if j >= p {
                j += 1;
            }
        }
        let (a, b) = (perm[i], perm[j]);
        perm.swap(i, j);
        pos[a] = j;
        pos[b] = i;
    }
    let last = n - 1;
    if perm[last] == last {
        let k = rng.gen_range(0..last);
        perm.swap(k, last);
    }
    perm
}

/// Reorder `items` by a fresh derangement.
pub fn derange<T: Clone, R: Rng + ?Sized>(items: &[T], rng: &mut R) -> Vec<T> {
    derangement(items.len(), rng)
        .into_iter()
        .map(|i| items[i].clone())
        .collect()
}

pub struct BodySwapCoordinator {
    forward: Arc<ForwardedRequestManager>,
    query_timeout: Duration,
}

struct QueryFailure {
    target: String,
    code: ResultCode,
}

impl BodySwapCoordinator {
    pub fn new(forward: Arc<ForwardedRequestManager>, query_timeout: Duration) -> Self {
        Self {
            forward,
            query_timeout,
        }
    }

    /// Swap identities among `targets`, plus the sender when the payload
    /// carries the sender's own identity.
    pub async fn swap(
        &self,
        sender: &str,
        targets: &[String],
        payload: BodySwapPayload,
        required: PermissionSet,
    ) -> Response {
        let participants = targets.len() + usize::from(payload.sender_identity.is_some());
        if participants < 2 {
            return Response::rejected(ResultCode::TooFewTargets);
        }
        let presence = match self.forward.admit_sender(sender) {
            Ok(p) => p,
            Err(code) => return Response::rejected(code),
        };

        let mut identities = match self.query_all(sender, targets, &required).await {
            Ok(ids) => ids,
            Err(failure) => {
                metrics::inc_body_swap_aborted();
                metrics::record_target_result(failure.code);
                presence.touch();
                info!(
                    "body swap from {} aborted: {} answered {}",
                    redact_code(sender),
                    redact_code(&failure.target),
                    failure.code
                );
                let mut results = HashMap::with_capacity(1);
                results.insert(failure.target, failure.code);
                return Response {
                    response_code: failure.code,
                    results,
                    payload: None,
                };
            }
        };
        if let Some(own) = payload.sender_identity.clone() {
            identities.push(own);
        }

        let perm = derangement(identities.len(), &mut rand::thread_rng());
        let mut assigned: Vec<CharacterIdentity> =
            perm.iter().map(|&i| identities[i].clone()).collect();

        let sender_assignment = if payload.sender_identity.is_some() {
            assigned.pop()
        } else {
            None
        };
        let deliveries = targets
            .iter()
            .cloned()
            .zip(assigned)
            .map(|(target, identity)| {
                let assignment = BodySwapAssignment {
                    identity,
                    attributes: payload.attributes,
                    lock_code: payload.lock_code.clone(),
                };
                (target, ActionPayload::BodySwapAssignment(assignment))
            })
            .collect();

        let results = self
            .forward
            .send_each(&presence, deliveries, Method::BodySwap, required)
            .await;
        metrics::inc_body_swap_completed();

        let mut response = Response::processed(results);
        response.payload = sender_assignment.map(ResponsePayload::AssignedIdentity);
        response
    }

    /// Collect every target's identity, in target order, or the first failure.
    async fn query_all(
        &self,
        sender: &str,
        targets: &[String],
        required: &PermissionSet,
    ) -> Result<Vec<CharacterIdentity>, QueryFailure> {
        let cancel = CancellationToken::new();
        let first_failure: Mutex<Option<QueryFailure>> = Mutex::new(None);
        let answered: Mutex<Vec<bool>> = Mutex::new(vec![false; targets.len()]);

        let fail = |target: &str, code: ResultCode| {
            let mut slot = first_failure.lock();
            if slot.is_none() {
                *slot = Some(QueryFailure {
                    target: target.to_string(),
                    code,
                });
            }
            drop(slot);
            cancel.cancel();
        };

        let queries = targets.iter().enumerate().map(|(i, target)| {
            let cancel = cancel.clone();
            let fail = &fail;
            let answered = &answered;
            async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    outcome = self.query_one(sender, target, required) => outcome,
                };
                answered.lock()[i] = true;
                match outcome {
                    Ok(identity) => Some(identity),
                    Err(code) => {
                        fail(target, code);
                        None
                    }
                }
            }
        });

        let identities = match tokio::time::timeout(self.query_timeout, join_all(queries)).await {
            Ok(ids) => ids,
            Err(_) => {
                sec_log!(
                    "body swap query phase from {} exceeded {}ms",
                    redact_code(sender),
                    self.query_timeout.as_millis()
                );
                let straggler = answered
                    .lock()
                    .iter()
                    .position(|done| !done)
                    .and_then(|i| targets.get(i))
                    .cloned()
                    .unwrap_or_default();
                fail(&straggler, ResultCode::Timeout);
                Vec::new()
            }
        };

        if let Some(failure) = first_failure.lock().take() {
            return Err(failure);
        }
        // No failure recorded means every query produced an identity.
        Ok(identities.into_iter().flatten().collect())
    }

    async fn query_one(
        &self,
        sender: &str,
        target: &str,
        required: &PermissionSet,
    ) -> Result<CharacterIdentity, ResultCode> {
        let presence = self.forward.check_target(sender, target, required).await?;
        let command = Command {
            sender_friend_code: sender.to_string(),
            payload: ActionPayload::BodySwapQuery,
        };
        let reply = self
            .forward
            .invoke(&presence, Method::BodySwapQuery, command, self.query_timeout)
            .await;
        match (reply.result, reply.payload) {
            (ResultCode::Success, Some(ReplyPayload::Identity(identity))) => {
                debug!("body swap query {} answered", redact_code(target));
                Ok(identity)
            }
            (ResultCode::Success, None) => Err(ResultCode::Unknown),
            (code, _) => Err(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::relay::loopback::{LoopbackClient, LoopbackScript};
    use crate::relay::permissions::{PermissionEdge, PrimaryPermissions};
    use crate::relay::presence::PresenceRegistry;
    use crate::relay::protocol::SwapAttributes;
    use crate::relay::store::{InMemoryPermissionStore, PermissionStore};
    use proptest::prelude::*;
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    proptest! {
        #[test]
        fn derangement_has_no_fixed_points(n in 2usize..64, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let perm = derangement(n, &mut rng);
            let mut seen = vec![false; n];
            for (i, &p) in perm.iter().enumerate() {
                prop_assert_ne!(i, p);
                prop_assert!(!seen[p]);
                seen[p] = true;
            }
        }
    }

    #[test]
    fn two_items_swap_directly() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(derange(&["a", "b"], &mut rng), vec!["b", "a"]);
        assert_eq!(derangement(1, &mut rng), vec![0]);
        assert!(derangement(0, &mut rng).is_empty());
    }

    #[test]
    fn last_slot_fixup_keeps_derangement() {
        // An all-zero generator always draws the lowest candidate, which
        // leaves the last value in place until the fixup moves it.
        let mut rng = StepRng::new(0, 0);
        assert_eq!(derangement(3, &mut rng), vec![2, 0, 1]);
    }

    #[test]
    fn four_participants_reach_every_derangement() {
        let mut seen = std::collections::HashSet::new();
        for seed in 0..2_000u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            seen.insert(derangement(4, &mut rng));
        }
        assert!(seen.contains(&vec![1, 0, 3, 2]));
        assert_eq!(seen.len(), 9);
    }

    fn limits() -> RateLimitConfig {
        RateLimitConfig {
            general_capacity: 100,
            general_refill_interval_ms: 1000,
            possession_capacity: 100,
            possession_refill_interval_ms: 1000,
        }
    }

    fn required() -> PermissionSet {
        PermissionSet::primary(PrimaryPermissions::BODY_SWAP | PrimaryPermissions::CUSTOMIZATION)
    }

    fn payload(sender_identity: Option<CharacterIdentity>) -> BodySwapPayload {
        BodySwapPayload {
            attributes: SwapAttributes {
                customization: true,
                ..SwapAttributes::default()
            },
            sender_identity,
            lock_code: None,
        }
    }

    async fn setup(
        codes: &[&'static str],
        permitted: &[&'static str],
    ) -> (BodySwapCoordinator, HashMap<&'static str, LoopbackClient>) {
        let presences = Arc::new(PresenceRegistry::new());
        let store = Arc::new(InMemoryPermissionStore::new());
        let mut clients = HashMap::new();
        for code in codes {
            let client = LoopbackClient::spawn(code, &format!("{code} Name"), "World");
            presences.add(client.presence(&limits()));
            clients.insert(*code, client);
        }
        for code in permitted {
            store
                .update_single_permissions(PermissionEdge::allowing(*code, "S", required()))
                .await
                .unwrap();
        }
        let forward = Arc::new(ForwardedRequestManager::new(
            presences,
            store,
            Duration::from_millis(500),
        ));
        (
            BodySwapCoordinator::new(forward, Duration::from_millis(500)),
            clients,
        )
    }

    fn targets(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn three_targets_all_change_identity() {
        let (coord, clients) = setup(&["S", "A", "B", "C"], &["A", "B", "C"]).await;
        let before: HashMap<_, _> = ["A", "B", "C"]
            .iter()
            .map(|c| (*c, clients[c].identity()))
            .collect();

        let resp = coord.swap("S", &targets(&["A", "B", "C"]), payload(None), required()).await;
        assert_eq!(resp.response_code, ResultCode::Success);
        assert_eq!(resp.payload, None);
        for code in ["A", "B", "C"] {
            assert_eq!(resp.result_for(code), Some(ResultCode::Success));
            assert_eq!(clients[code].received_count(Method::BodySwap), 1);
            assert_ne!(clients[code].identity(), before[code]);
        }
    }

    #[tokio::test]
    async fn sender_included_gets_assignment_in_response() {
        let (coord, clients) = setup(&["S", "A"], &["A"]).await;
        let own = CharacterIdentity {
            character_name: "Sender Name".into(),
            character_world: "World".into(),
            appearance: "appearance:S".into(),
        };
        let original_a = clients["A"].identity();
        let resp = coord.swap("S", &targets(&["A"]), payload(Some(own.clone())), required()).await;
        assert_eq!(resp.result_for("A"), Some(ResultCode::Success));
        assert_eq!(clients["A"].identity(), own);
        assert_eq!(resp.payload, Some(ResponsePayload::AssignedIdentity(original_a)));
    }

    #[tokio::test]
    async fn single_target_without_sender_is_too_few() {
        let (coord, clients) = setup(&["S", "A"], &["A"]).await;
        let resp = coord.swap("S", &targets(&["A"]), payload(None), required()).await;
        assert_eq!(resp.response_code, ResultCode::TooFewTargets);
        assert!(clients["A"].received().is_empty());
    }

    #[tokio::test]
    async fn one_missing_permission_aborts_everything() {
        let (coord, clients) = setup(&["S", "A", "B", "C"], &["A", "B"]).await;
        let resp = coord.swap("S", &targets(&["A", "B", "C"]), payload(None), required()).await;
        assert_eq!(resp.response_code, ResultCode::TargetNotFriends);
        assert_eq!(resp.result_for("C"), Some(ResultCode::TargetNotFriends));
        for code in ["A", "B", "C"] {
            assert_eq!(clients[code].received_count(Method::BodySwap), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_query_times_out_and_aborts() {
        let (coord, clients) = setup(&["S", "A", "B"], &["A", "B"]).await;
        clients["B"].script(Method::BodySwapQuery, LoopbackScript::Stall);
        let resp = coord.swap("S", &targets(&["A", "B"]), payload(None), required()).await;
        assert_eq!(resp.response_code, ResultCode::Timeout);
        assert_eq!(clients["A"].received_count(Method::BodySwap), 0);
        assert_eq!(clients["B"].received_count(Method::BodySwap), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_failure_cancels_pending_sibling() {
        let (coord, clients) = setup(&["S", "A", "B"], &["A", "B"]).await;
        clients["A"].script(Method::BodySwapQuery, LoopbackScript::Stall);
        clients["B"].script(Method::BodySwapQuery, LoopbackScript::Fail("no body".into()));

        let started = tokio::time::Instant::now();
        let resp = coord.swap("S", &targets(&["A", "B"]), payload(None), required()).await;
        let elapsed = started.elapsed();

        assert_eq!(resp.response_code, ResultCode::Unknown);
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.result_for("B"), Some(ResultCode::Unknown));
        assert!(elapsed < Duration::from_millis(500), "waited {elapsed:?} for the stalled query");
        assert_eq!(clients["A"].received_count(Method::BodySwapQuery), 1);
        assert_eq!(clients["A"].received_count(Method::BodySwap), 0);
    }
}
