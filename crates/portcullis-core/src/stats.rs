//! Live per-service and global traffic statistics.
//!
//! Counters are monotonic atomics updated at request completion; rates come
//! from a ring of 60 one-second buckets. A bucket is claimed for the current
//! epoch second with a compare-exchange, so writers never lock. Cluster-wide
//! numbers aggregate the local view with each peer's last published
//! [`StatsView`].

use chrono::Utc;
use dashmap::DashMap;
use portcullis_types::models::StatsView;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Width of the sliding window, in one-second buckets.
const WINDOW_SECS: i64 = 60;

/// Peers silent for longer than this are excluded from aggregation.
const PEER_STALE_AFTER_SECS: u64 = 30;

#[derive(Default)]
struct SecondBucket {
    sec: AtomicI64,
    calls: AtomicU64,
    data_in: AtomicU64,
    data_out: AtomicU64,
    duration_ms: AtomicU64,
    overhead_ms: AtomicU64,
}

impl SecondBucket {
    /// Claim the bucket for `sec`, zeroing stale contents. Exactly one racer
    /// wins the claim; the rest observe an already-current bucket.
    fn claim(&self, sec: i64) {
        let seen = self.sec.load(Ordering::Acquire);
        if seen != sec && self.sec.compare_exchange(seen, sec, Ordering::AcqRel, Ordering::Acquire).is_ok()
        {
            self.calls.store(0, Ordering::Relaxed);
            self.data_in.store(0, Ordering::Relaxed);
            self.data_out.store(0, Ordering::Relaxed);
            self.duration_ms.store(0, Ordering::Relaxed);
            self.overhead_ms.store(0, Ordering::Relaxed);
        }
    }

    fn is_fresh(&self, now_sec: i64) -> bool {
        let sec = self.sec.load(Ordering::Acquire);
        sec > now_sec - WINDOW_SECS && sec <= now_sec
    }
}

/// Monotonic counters + sliding-window rate estimators for one scope
/// (a service, or the whole gateway).
pub struct LiveCounters {
    calls: AtomicU64,
    data_in: AtomicU64,
    data_out: AtomicU64,
    duration_sum_ms: AtomicU64,
    overhead_sum_ms: AtomicU64,
    in_flight: AtomicI64,
    buckets: Vec<SecondBucket>,
}

impl LiveCounters {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            data_in: AtomicU64::new(0),
            data_out: AtomicU64::new(0),
            duration_sum_ms: AtomicU64::new(0),
            overhead_sum_ms: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            buckets: (0..WINDOW_SECS).map(|_| SecondBucket::default()).collect(),
        }
    }

    fn bucket(&self, sec: i64) -> &SecondBucket {
        let idx = (sec.rem_euclid(WINDOW_SECS)) as usize;
        let bucket = &self.buckets[idx];
        bucket.claim(sec);
        bucket
    }

    /// Record one completed call at the current instant.
    pub fn record_call(&self, duration_ms: u64, overhead_ms: u64) {
        self.record_call_at(Utc::now().timestamp(), duration_ms, overhead_ms);
    }

    /// Record one completed call in the bucket for `sec`.
    pub fn record_call_at(&self, sec: i64, duration_ms: u64, overhead_ms: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.duration_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.overhead_sum_ms.fetch_add(overhead_ms, Ordering::Relaxed);
        let bucket = self.bucket(sec);
        bucket.calls.fetch_add(1, Ordering::Relaxed);
        bucket.duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        bucket.overhead_ms.fetch_add(overhead_ms, Ordering::Relaxed);
    }

    /// Count inbound payload bytes.
    pub fn add_data_in(&self, bytes: u64) {
        self.add_data_in_at(Utc::now().timestamp(), bytes);
    }

    /// Count inbound payload bytes in the bucket for `sec`.
    pub fn add_data_in_at(&self, sec: i64, bytes: u64) {
        self.data_in.fetch_add(bytes, Ordering::Relaxed);
        self.bucket(sec).data_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count outbound payload bytes.
    pub fn add_data_out(&self, bytes: u64) {
        self.add_data_out_at(Utc::now().timestamp(), bytes);
    }

    /// Count outbound payload bytes in the bucket for `sec`.
    pub fn add_data_out_at(&self, sec: i64, bytes: u64) {
        self.data_out.fetch_add(bytes, Ordering::Relaxed);
        self.bucket(sec).data_out.fetch_add(bytes, Ordering::Relaxed);
    }

    fn enter(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Requests currently in flight.
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Lifetime totals: (calls, data in, data out).
    pub fn totals(&self) -> (u64, u64, u64) {
        (
            self.calls.load(Ordering::Relaxed),
            self.data_in.load(Ordering::Relaxed),
            self.data_out.load(Ordering::Relaxed),
        )
    }

    /// Lifetime averages: (duration ms, overhead ms).
    pub fn lifetime_averages(&self) -> (f64, f64) {
        let calls = self.calls.load(Ordering::Relaxed);
        if calls == 0 {
            return (0.0, 0.0);
        }
        (
            self.duration_sum_ms.load(Ordering::Relaxed) as f64 / calls as f64,
            self.overhead_sum_ms.load(Ordering::Relaxed) as f64 / calls as f64,
        )
    }

    /// Sliding-window view at the current instant.
    pub fn view(&self) -> StatsView {
        self.view_at(Utc::now().timestamp())
    }

    /// Sliding-window view at `now_sec`.
    pub fn view_at(&self, now_sec: i64) -> StatsView {
        let mut calls = 0u64;
        let mut data_in = 0u64;
        let mut data_out = 0u64;
        let mut duration = 0u64;
        let mut overhead = 0u64;
        for bucket in &self.buckets {
            if bucket.is_fresh(now_sec) {
                calls += bucket.calls.load(Ordering::Relaxed);
                data_in += bucket.data_in.load(Ordering::Relaxed);
                data_out += bucket.data_out.load(Ordering::Relaxed);
                duration += bucket.duration_ms.load(Ordering::Relaxed);
                overhead += bucket.overhead_ms.load(Ordering::Relaxed);
            }
        }
        let window = WINDOW_SECS as f64;
        StatsView {
            rate: calls as f64 / window,
            duration: if calls == 0 { 0.0 } else { duration as f64 / calls as f64 },
            overhead: if calls == 0 { 0.0 } else { overhead as f64 / calls as f64 },
            data_in_rate: data_in as f64 / window,
            data_out_rate: data_out as f64 / window,
            concurrent_handled_requests: self.in_flight(),
        }
    }
}

/// Registry of live counters: one global scope plus one per service.
pub struct LiveStatsRegistry {
    global: Arc<LiveCounters>,
    per_service: DashMap<String, Arc<LiveCounters>>,
    started_at: Instant,
}

impl LiveStatsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            global: Arc::new(LiveCounters::new()),
            per_service: DashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// The gateway-wide counters.
    pub fn global(&self) -> Arc<LiveCounters> {
        self.global.clone()
    }

    /// Counters for one service, created on first use.
    pub fn service(&self, service_id: &str) -> Arc<LiveCounters> {
        self.per_service
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(LiveCounters::new()))
            .clone()
    }

    /// Snapshot of every known service scope.
    pub fn all_services(&self) -> Vec<(String, Arc<LiveCounters>)> {
        self.per_service.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    /// Seconds since the registry (i.e. the process) started.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for LiveStatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII in-flight marker covering both the global scope and the service scope.
/// Held until the response body finishes streaming (or the request dies).
pub struct InFlightGuard {
    scopes: Vec<Arc<LiveCounters>>,
}

impl InFlightGuard {
    /// Enter the given scopes.
    pub fn enter(scopes: Vec<Arc<LiveCounters>>) -> Self {
        for scope in &scopes {
            scope.enter();
        }
        Self { scopes }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        for scope in &self.scopes {
            scope.leave();
        }
    }
}

/// Last published stats of every cluster peer.
pub struct ClusterState {
    peers: DashMap<String, (StatsView, Instant)>,
}

impl ClusterState {
    /// Create an empty peer registry.
    pub fn new() -> Self {
        Self { peers: DashMap::new() }
    }

    /// Store a peer's freshly published view.
    pub fn publish(&self, peer_id: &str, view: StatsView) {
        self.peers.insert(peer_id.to_string(), (view, Instant::now()));
    }

    /// Views of peers heard from recently.
    pub fn fresh_peer_views(&self) -> Vec<StatsView> {
        self.peers
            .iter()
            .filter(|e| e.value().1.elapsed().as_secs() < PEER_STALE_AFTER_SECS)
            .map(|e| e.value().0)
            .collect()
    }

    /// Leader-side aggregation: local + every fresh peer.
    pub fn aggregate(&self, local: StatsView) -> StatsView {
        StatsView::aggregate(local, &self.fresh_peer_views())
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_rate_counts_only_recent_buckets() {
        let counters = LiveCounters::new();
        let now = 1_000_000;

        // 120 calls spread over the last 60 seconds, plus stale traffic
        for s in 0..60 {
            counters.record_call_at(now - s, 10, 1);
            counters.record_call_at(now - s, 10, 1);
        }
        counters.record_call_at(now - 300, 10, 1); // outside the window ring

        let view = counters.view_at(now);
        assert!((view.rate - 2.0).abs() < 0.05, "rate {}", view.rate);
        assert_eq!(view.duration, 10.0);
        assert_eq!(view.overhead, 1.0);
    }

    #[test]
    fn data_rates_average_over_the_window() {
        let counters = LiveCounters::new();
        let now = 2_000_000;
        counters.add_data_in_at(now, 60_000);
        counters.add_data_out_at(now, 120_000);
        let view = counters.view_at(now);
        assert_eq!(view.data_in_rate, 1_000.0);
        assert_eq!(view.data_out_rate, 2_000.0);
    }

    #[test]
    fn buckets_recycle_after_a_full_rotation() {
        let counters = LiveCounters::new();
        counters.record_call_at(100, 5, 1);
        // same ring slot, one rotation later: old content must not leak
        counters.record_call_at(160, 7, 1);
        let view = counters.view_at(160);
        assert_eq!(view.duration, 7.0);
        let (calls, _, _) = counters.totals();
        assert_eq!(calls, 2);
    }

    #[test]
    fn in_flight_guard_is_raii() {
        let registry = LiveStatsRegistry::new();
        let svc = registry.service("svc-1");
        {
            let _guard = InFlightGuard::enter(vec![registry.global(), svc.clone()]);
            assert_eq!(registry.global().in_flight(), 1);
            assert_eq!(svc.in_flight(), 1);
        }
        assert_eq!(registry.global().in_flight(), 0);
        assert_eq!(svc.in_flight(), 0);
    }

    #[test]
    fn leader_rate_is_sum_of_peers_plus_local() {
        let cluster = ClusterState::new();
        cluster.publish("peer-a", StatsView { rate: 5.0, ..Default::default() });
        cluster.publish("peer-b", StatsView { rate: 7.5, ..Default::default() });
        let agg = cluster.aggregate(StatsView { rate: 2.5, ..Default::default() });
        assert_eq!(agg.rate, 15.0);
    }
}
