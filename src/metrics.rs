//! Process-wide relay counters.
//! Read by the binary's status and smoke test reports; no exporter yet.
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::relay::codes::ResultCode;

static REQUESTS_HANDLED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_RATE_LIMITED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_REJECTED: AtomicU64 = AtomicU64::new(0);
static POSSESSION_STARTED: AtomicU64 = AtomicU64::new(0);
static POSSESSION_ENDED: AtomicU64 = AtomicU64::new(0);
static POSSESSION_DESYNCS: AtomicU64 = AtomicU64::new(0);
static BODY_SWAPS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static BODY_SWAPS_ABORTED: AtomicU64 = AtomicU64::new(0);

const ZERO: AtomicU64 = AtomicU64::new(0);
static TARGET_RESULTS: [AtomicU64; ResultCode::COUNT] = [ZERO; ResultCode::COUNT];

pub fn inc_requests_handled() {
    REQUESTS_HANDLED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_rate_limited() {
    REQUESTS_RATE_LIMITED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_rejected() {
    REQUESTS_REJECTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_target_result(code: ResultCode) {
    TARGET_RESULTS[code.index()].fetch_add(1, Ordering::Relaxed);
}

pub fn inc_possession_started() {
    POSSESSION_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_possession_ended() {
    POSSESSION_ENDED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_possession_desync() {
    POSSESSION_DESYNCS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_body_swap_completed() {
    BODY_SWAPS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_body_swap_aborted() {
    BODY_SWAPS_ABORTED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub requests_handled: u64,
    pub requests_rate_limited: u64,
    pub requests_rejected: u64,
    /// Per-target outcomes, keyed by result code name; zero counts omitted.
    pub target_results: BTreeMap<&'static str, u64>,
    pub possession_started: u64,
    pub possession_ended: u64,
    pub possession_desyncs: u64,
    pub body_swaps_completed: u64,
    pub body_swaps_aborted: u64,
}

pub fn snapshot() -> Snapshot {
    let target_results = ResultCode::ALL
        .iter()
        .filter_map(|code| {
            let n = TARGET_RESULTS[code.index()].load(Ordering::Relaxed);
            (n > 0).then_some((code.as_str(), n))
        })
        .collect();
    Snapshot {
        requests_handled: REQUESTS_HANDLED.load(Ordering::Relaxed),
        requests_rate_limited: REQUESTS_RATE_LIMITED.load(Ordering::Relaxed),
        requests_rejected: REQUESTS_REJECTED.load(Ordering::Relaxed),
        target_results,
        possession_started: POSSESSION_STARTED.load(Ordering::Relaxed),
        possession_ended: POSSESSION_ENDED.load(Ordering::Relaxed),
        possession_desyncs: POSSESSION_DESYNCS.load(Ordering::Relaxed),
        body_swaps_completed: BODY_SWAPS_COMPLETED.load(Ordering::Relaxed),
        body_swaps_aborted: BODY_SWAPS_ABORTED.load(Ordering::Relaxed),
    }
}
