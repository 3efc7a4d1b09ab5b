//! Cluster statistics views.

use serde::{Deserialize, Serialize};

/// The live numbers a cluster member publishes to its peers.
///
/// Rates and in-flight counts are summed across the cluster; durations and
/// overheads are averaged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    /// Calls per second over the sliding window
    pub rate: f64,
    /// Average call duration in milliseconds
    pub duration: f64,
    /// Average gateway overhead in milliseconds
    pub overhead: f64,
    /// Inbound bytes per second
    pub data_in_rate: f64,
    /// Outbound bytes per second
    pub data_out_rate: f64,
    /// Requests currently in flight
    pub concurrent_handled_requests: i64,
}

impl StatsView {
    /// Aggregate a leader's local view with its peers' last published views:
    /// sum the rates and in-flight counts, average the durations.
    pub fn aggregate(local: StatsView, peers: &[StatsView]) -> StatsView {
        let n = (peers.len() + 1) as f64;
        let mut out = StatsView {
            rate: local.rate,
            duration: local.duration,
            overhead: local.overhead,
            data_in_rate: local.data_in_rate,
            data_out_rate: local.data_out_rate,
            concurrent_handled_requests: local.concurrent_handled_requests,
        };
        for p in peers {
            out.rate += p.rate;
            out.data_in_rate += p.data_in_rate;
            out.data_out_rate += p.data_out_rate;
            out.concurrent_handled_requests += p.concurrent_handled_requests;
            out.duration += p.duration;
            out.overhead += p.overhead;
        }
        out.duration /= n;
        out.overhead /= n;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_rates_and_averages_durations() {
        let local = StatsView {
            rate: 10.0,
            duration: 100.0,
            overhead: 4.0,
            data_in_rate: 1000.0,
            data_out_rate: 2000.0,
            concurrent_handled_requests: 3,
        };
        let peers = [
            StatsView {
                rate: 5.0,
                duration: 200.0,
                overhead: 8.0,
                data_in_rate: 500.0,
                data_out_rate: 700.0,
                concurrent_handled_requests: 2,
            },
            StatsView {
                rate: 2.5,
                duration: 300.0,
                overhead: 12.0,
                data_in_rate: 100.0,
                data_out_rate: 300.0,
                concurrent_handled_requests: 1,
            },
        ];
        let agg = StatsView::aggregate(local, &peers);
        assert_eq!(agg.rate, 17.5);
        assert_eq!(agg.data_in_rate, 1600.0);
        assert_eq!(agg.data_out_rate, 3000.0);
        assert_eq!(agg.concurrent_handled_requests, 6);
        assert_eq!(agg.duration, 200.0);
        assert_eq!(agg.overhead, 8.0);
    }
}
