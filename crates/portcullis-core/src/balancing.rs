//! Target selection: placement predicates and load-balancing policies.
//!
//! Sticky and IP-hash selection derive a 64-bit key from the session
//! identifier (first 8 bytes of its SHA-256 digest) and map it onto the
//! target list with Jump Consistent Hash, so the chosen index is
//! deterministic for a fixed key and target-set size and moves minimally
//! when the set grows or shrinks.

use dashmap::DashMap;
use portcullis_types::models::{LoadBalancing, Target, TargetPredicate};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::env::InstancePosition;

/// Smoothing factor for the per-target response-time average.
const EWMA_ALPHA: f64 = 0.5;

/// Filter targets by their placement predicate. An empty result falls back to
/// the unfiltered list so a misconfigured predicate never breaks traffic.
pub fn eligible_targets(targets: &[Target], position: &InstancePosition) -> Vec<Target> {
    let filtered: Vec<Target> =
        targets.iter().filter(|t| predicate_matches(&t.predicate, position)).cloned().collect();
    if filtered.is_empty() {
        targets.to_vec()
    } else {
        filtered
    }
}

fn predicate_matches(predicate: &TargetPredicate, position: &InstancePosition) -> bool {
    match predicate {
        TargetPredicate::AllMatch => true,
        TargetPredicate::RegionMatch { region } => region == &position.region,
        TargetPredicate::ZoneMatch { zone } => zone == &position.zone,
        TargetPredicate::RegionAndZoneMatch { region, zone } => {
            region == &position.region && zone == &position.zone
        }
        TargetPredicate::NetworkLocation { provider, region, zone, data_center, rack } => {
            let field = |want: &Option<String>, have: &str| {
                want.as_ref().map(|w| w == have).unwrap_or(true)
            };
            field(provider, &position.provider)
                && field(region, &position.region)
                && field(zone, &position.zone)
                && field(data_center, &position.data_center)
                && field(rack, &position.rack)
        }
    }
}

/// Stable 64-bit key from an arbitrary string.
pub fn hash64(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// Jump Consistent Hash (Lamport & Veach): maps `key` to a bucket in
/// `[0, buckets)` with minimal movement as `buckets` changes.
pub fn jump_hash(mut key: u64, buckets: u32) -> u32 {
    debug_assert!(buckets > 0);
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < i64::from(buckets) {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        let r = ((1u64 << 31) as f64) / (((key >> 33) + 1) as f64);
        j = (((b + 1) as f64) * r) as i64;
    }
    b as u32
}

/// What a policy may key its decision on.
pub struct SelectionKeys<'a> {
    /// Tracking-cookie value (Sticky)
    pub tracking_id: &'a str,
    /// Client IP (IpAddressHash)
    pub client_ip: &'a str,
}

/// Per-process bookkeeping shared by all services: rotation counters and
/// response-time averages. Keys are `service_id` / `service_id|target_key`.
pub struct BalancingState {
    rotations: DashMap<String, AtomicUsize>,
    tie_breaks: DashMap<String, AtomicUsize>,
    response_times: DashMap<String, AtomicU64>,
}

impl BalancingState {
    /// Create empty bookkeeping.
    pub fn new() -> Self {
        Self {
            rotations: DashMap::new(),
            tie_breaks: DashMap::new(),
            response_times: DashMap::new(),
        }
    }

    /// Pick one target from `targets` according to `policy`.
    ///
    /// `targets` must already be predicate-filtered (and, on retries, stripped
    /// of targets used by previous attempts). Returns `None` only for an empty
    /// list.
    pub fn select(
        &self,
        policy: &LoadBalancing,
        service_id: &str,
        targets: &[Target],
        keys: &SelectionKeys<'_>,
    ) -> Option<Target> {
        if targets.is_empty() {
            return None;
        }
        if targets.len() == 1 {
            return Some(targets[0].clone());
        }
        let chosen = match policy {
            LoadBalancing::RoundRobin => {
                let expanded = weight_expand(targets);
                let n = self.next_rotation(service_id);
                expanded[n % expanded.len()]
            }
            LoadBalancing::Random => {
                let expanded = weight_expand(targets);
                expanded[rand::thread_rng().gen_range(0..expanded.len())]
            }
            LoadBalancing::Sticky => {
                jump_hash(hash64(keys.tracking_id), targets.len() as u32) as usize
            }
            LoadBalancing::IpAddressHash => {
                jump_hash(hash64(keys.client_ip), targets.len() as u32) as usize
            }
            LoadBalancing::BestResponseTime => self.best_index(service_id, targets),
            LoadBalancing::WeightedBestResponseTime { ratio } => {
                let best = self.best_index(service_id, targets);
                if rand::thread_rng().gen_bool(ratio.clamp(0.0, 1.0)) {
                    best
                } else {
                    // uniform among the others
                    let mut idx = rand::thread_rng().gen_range(0..targets.len() - 1);
                    if idx >= best {
                        idx += 1;
                    }
                    idx
                }
            }
        };
        Some(targets[chosen].clone())
    }

    /// Fold an observed response time into the target's average.
    pub fn record_response_time(&self, service_id: &str, target_key: &str, millis: f64) {
        let entry = self
            .response_times
            .entry(format!("{service_id}|{target_key}"))
            .or_insert_with(|| AtomicU64::new(0f64.to_bits()));
        let old = f64::from_bits(entry.load(Ordering::Relaxed));
        let new = if old == 0.0 { millis } else { old * (1.0 - EWMA_ALPHA) + millis * EWMA_ALPHA };
        entry.store(new.to_bits(), Ordering::Relaxed);
    }

    /// Current average for a target; 0.0 means never observed.
    pub fn average_response_time(&self, service_id: &str, target_key: &str) -> f64 {
        self.response_times
            .get(&format!("{service_id}|{target_key}"))
            .map(|v| f64::from_bits(v.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    fn next_rotation(&self, service_id: &str) -> usize {
        self.rotations
            .entry(service_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Index of the target with the lowest average; ties (including the
    /// all-unseen cold start) are broken by a per-service rotation so every
    /// target gets traffic within its first `|targets|` calls.
    fn best_index(&self, service_id: &str, targets: &[Target]) -> usize {
        let averages: Vec<f64> = targets
            .iter()
            .map(|t| self.average_response_time(service_id, &t.key()))
            .collect();
        let min = averages.iter().copied().fold(f64::INFINITY, f64::min);
        let tied: Vec<usize> = averages
            .iter()
            .enumerate()
            .filter(|(_, avg)| **avg <= min)
            .map(|(i, _)| i)
            .collect();
        if tied.len() == 1 {
            return tied[0];
        }
        let n = self
            .tie_breaks
            .entry(service_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
        tied[n % tied.len()]
    }
}

impl Default for BalancingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand target indices by weight: weight 3 appears three times.
fn weight_expand(targets: &[Target]) -> Vec<usize> {
    let mut out = Vec::new();
    for (i, t) in targets.iter().enumerate() {
        for _ in 0..t.weight.max(1) {
            out.push(i);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use portcullis_types::models::TargetScheme;

    fn target(host: &str, weight: u32) -> Target {
        Target { host: host.into(), scheme: TargetScheme::Http, weight, ..Default::default() }
    }

    fn keys<'a>() -> SelectionKeys<'a> {
        SelectionKeys { tracking_id: "t-1", client_ip: "10.0.0.1" }
    }

    #[test]
    fn weighted_round_robin_is_exact_over_one_rotation() {
        let state = BalancingState::new();
        let targets =
            vec![target("a:80", 3), target("b:80", 2), target("c:80", 1)];

        let mut counts = std::collections::HashMap::new();
        for _ in 0..6 {
            let t = state
                .select(&LoadBalancing::RoundRobin, "svc", &targets, &keys())
                .unwrap();
            *counts.entry(t.host).or_insert(0u32) += 1;
        }
        assert_eq!(counts["a:80"], 3);
        assert_eq!(counts["b:80"], 2);
        assert_eq!(counts["c:80"], 1);
    }

    #[test]
    fn round_robin_weight_proportionality_converges() {
        let state = BalancingState::new();
        let targets =
            vec![target("a:80", 3), target("b:80", 2), target("c:80", 1)];
        let mut counts = std::collections::HashMap::new();
        for _ in 0..6_000 {
            let t = state
                .select(&LoadBalancing::RoundRobin, "svc", &targets, &keys())
                .unwrap();
            *counts.entry(t.host).or_insert(0u32) += 1;
        }
        assert_eq!(counts["a:80"], 3_000);
        assert_eq!(counts["b:80"], 2_000);
        assert_eq!(counts["c:80"], 1_000);
    }

    #[test]
    fn sticky_is_deterministic_for_a_fixed_tracking_id() {
        let state = BalancingState::new();
        let targets = vec![target("a:80", 1), target("b:80", 1), target("c:80", 1)];
        let first = state
            .select(&LoadBalancing::Sticky, "svc", &targets, &keys())
            .unwrap();
        for _ in 0..100 {
            let again = state
                .select(&LoadBalancing::Sticky, "svc", &targets, &keys())
                .unwrap();
            assert_eq!(again.host, first.host);
        }
    }

    #[test]
    fn ip_hash_is_stable_per_source_ip() {
        let state = BalancingState::new();
        let targets = vec![target("a:80", 1), target("b:80", 1), target("c:80", 1)];
        let ks = SelectionKeys { tracking_id: "ignored", client_ip: "192.168.7.9" };
        let first = state
            .select(&LoadBalancing::IpAddressHash, "svc", &targets, &ks)
            .unwrap();
        for _ in 0..100 {
            let again = state
                .select(&LoadBalancing::IpAddressHash, "svc", &targets, &ks)
                .unwrap();
            assert_eq!(again.host, first.host);
        }
    }

    #[test]
    fn different_tracking_ids_spread_over_targets() {
        let state = BalancingState::new();
        let targets = vec![target("a:80", 1), target("b:80", 1), target("c:80", 1)];
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            let id = format!("session-{i}");
            let ks = SelectionKeys { tracking_id: &id, client_ip: "x" };
            seen.insert(state.select(&LoadBalancing::Sticky, "svc", &targets, &ks).unwrap().host);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn jump_hash_moves_minimally_when_buckets_grow() {
        // going from n to n+1 buckets must relocate only keys that land on the
        // new bucket
        let mut moved = 0;
        let total = 10_000;
        for i in 0..total {
            let key = hash64(&format!("k{i}"));
            let before = jump_hash(key, 10);
            let after = jump_hash(key, 11);
            if before != after {
                assert_eq!(after, 10);
                moved += 1;
            }
        }
        // roughly 1/11 of keys move
        assert!(moved < total / 8, "moved {moved} of {total}");
    }

    #[test]
    fn best_response_time_picks_the_fastest_known_target() {
        let state = BalancingState::new();
        let targets = vec![target("slow:80", 1), target("fast:80", 1)];
        state.record_response_time("svc", &targets[0].key(), 900.0);
        state.record_response_time("svc", &targets[1].key(), 30.0);

        for _ in 0..10 {
            let t = state
                .select(&LoadBalancing::BestResponseTime, "svc", &targets, &keys())
                .unwrap();
            assert_eq!(t.host, "fast:80");
        }
    }

    #[test]
    fn best_response_time_cold_start_rotates_over_all_targets() {
        let state = BalancingState::new();
        let targets = vec![target("a:80", 1), target("b:80", 1), target("c:80", 1)];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(
                state
                    .select(&LoadBalancing::BestResponseTime, "svc", &targets, &keys())
                    .unwrap()
                    .host,
            );
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn weighted_best_with_ratio_one_always_picks_best() {
        let state = BalancingState::new();
        let targets = vec![target("slow:80", 1), target("fast:80", 1)];
        state.record_response_time("svc", &targets[0].key(), 900.0);
        state.record_response_time("svc", &targets[1].key(), 30.0);

        for _ in 0..50 {
            let t = state
                .select(
                    &LoadBalancing::WeightedBestResponseTime { ratio: 1.0 },
                    "svc",
                    &targets,
                    &keys(),
                )
                .unwrap();
            assert_eq!(t.host, "fast:80");
        }
    }

    #[test]
    fn ewma_converges_toward_recent_samples() {
        let state = BalancingState::new();
        state.record_response_time("svc", "t", 100.0);
        state.record_response_time("svc", "t", 100.0);
        for _ in 0..16 {
            state.record_response_time("svc", "t", 10.0);
        }
        let avg = state.average_response_time("svc", "t");
        assert!(avg < 15.0, "avg {avg}");
    }

    #[test]
    fn region_predicates_filter_with_fallback() {
        let position = InstancePosition {
            region: "eu-west-1".into(),
            zone: "eu-west-1a".into(),
            ..Default::default()
        };
        let local = Target {
            host: "local:80".into(),
            predicate: TargetPredicate::RegionMatch { region: "eu-west-1".into() },
            ..Default::default()
        };
        let remote = Target {
            host: "remote:80".into(),
            predicate: TargetPredicate::RegionMatch { region: "us-east-1".into() },
            ..Default::default()
        };

        let eligible = eligible_targets(&[local.clone(), remote.clone()], &position);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].host, "local:80");

        // nothing matches: fall back to the full list
        let eligible = eligible_targets(&[remote.clone()], &position);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].host, "remote:80");
    }
}
