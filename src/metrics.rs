// SPDX-License-Identifier: Apache-2.0

//! Lightweight in-process counters for sessions and dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct EngineMetrics {
    logons: AtomicU64,
    logon_failures: AtomicU64,
    sessions_expired: AtomicU64,
    atomic_requests: AtomicU64,
    cancellations: AtomicU64,
    late_results_discarded: AtomicU64,
    fetch_timeouts: AtomicU64,
    authorization_denials: AtomicU64,
    visibility_denials: AtomicU64,
}

static ENGINE_METRICS: OnceLock<EngineMetrics> = OnceLock::new();

fn metrics() -> &'static EngineMetrics {
    ENGINE_METRICS.get_or_init(EngineMetrics::default)
}

pub fn record_logon(success: bool) {
    let metrics = metrics();
    if success {
        metrics.logons.fetch_add(1, Ordering::Relaxed);
    } else {
        metrics.logon_failures.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_session_expired() {
    metrics().sessions_expired.fetch_add(1, Ordering::Relaxed);
}

pub fn record_atomic_request() {
    metrics().atomic_requests.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cancel() {
    metrics().cancellations.fetch_add(1, Ordering::Relaxed);
}

pub fn record_late_result() {
    metrics()
        .late_results_discarded
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_fetch_timeout() {
    metrics().fetch_timeouts.fetch_add(1, Ordering::Relaxed);
}

pub fn record_authorization_denial() {
    metrics()
        .authorization_denials
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_visibility_denial() {
    metrics().visibility_denials.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineMetricsSnapshot {
    pub logons: u64,
    pub logon_failures: u64,
    pub sessions_expired: u64,
    pub atomic_requests: u64,
    pub cancellations: u64,
    pub late_results_discarded: u64,
    pub fetch_timeouts: u64,
    pub authorization_denials: u64,
    pub visibility_denials: u64,
}

pub fn snapshot() -> EngineMetricsSnapshot {
    let metrics = metrics();
    EngineMetricsSnapshot {
        logons: metrics.logons.load(Ordering::Relaxed),
        logon_failures: metrics.logon_failures.load(Ordering::Relaxed),
        sessions_expired: metrics.sessions_expired.load(Ordering::Relaxed),
        atomic_requests: metrics.atomic_requests.load(Ordering::Relaxed),
        cancellations: metrics.cancellations.load(Ordering::Relaxed),
        late_results_discarded: metrics.late_results_discarded.load(Ordering::Relaxed),
        fetch_timeouts: metrics.fetch_timeouts.load(Ordering::Relaxed),
        authorization_denials: metrics.authorization_denials.load(Ordering::Relaxed),
        visibility_denials: metrics.visibility_denials.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_grow() {
        // Other tests share the globals, so compare with at-least deltas.
        let initial = snapshot();

        record_logon(true);
        record_logon(false);
        let s1 = snapshot();
        assert!(s1.logons > initial.logons);
        assert!(s1.logon_failures > initial.logon_failures);

        record_cancel();
        record_late_result();
        let s2 = snapshot();
        assert!(s2.cancellations > s1.cancellations);
        assert!(s2.late_results_discarded > s1.late_results_discarded);

        record_authorization_denial();
        record_visibility_denial();
        let s3 = snapshot();
        assert!(s3.authorization_denials > s2.authorization_denials);
        assert!(s3.visibility_denials > s2.visibility_denials);
    }
}
