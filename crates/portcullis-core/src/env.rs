//! The explicit per-process context threaded through the pipeline.
//!
//! There is no global mutable state: every handler receives a
//! [`GatewayEnv`] carrying the config view, the datastore, quota counters,
//! live stats, the replay cache, the session store, the event sink and the
//! shared upstream clients.

use std::sync::Arc;

use crate::balancing::BalancingState;
use crate::events::{SharedSink, TracingSink};
use crate::forward::UpstreamClients;
use crate::monitor::RequestMonitor;
use crate::seccom::ReplayCache;
use crate::sessions::SessionStore;
use crate::stats::{ClusterState, LiveStatsRegistry};
use crate::store::quotas::QuotaStore;
use crate::store::{ConfigView, Datastore};

/// Where this instance runs, evaluated against target predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePosition {
    /// Infrastructure provider
    pub provider: String,
    /// Region
    pub region: String,
    /// Zone
    pub zone: String,
    /// Data center
    pub data_center: String,
    /// Rack
    pub rack: String,
}

impl Default for InstancePosition {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            region: "local".to_string(),
            zone: "local".to_string(),
            data_center: "local".to_string(),
            rack: "local".to_string(),
        }
    }
}

/// Shared state of one gateway instance.
pub struct GatewayEnv {
    /// Config writer (admin surfaces mutate through it)
    pub datastore: Arc<Datastore>,
    /// Config reader used on the hot path
    pub view: ConfigView,
    /// Per-API-key quota counters
    pub quotas: Arc<QuotaStore>,
    /// Live traffic statistics
    pub stats: Arc<LiveStatsRegistry>,
    /// Peer stats registry for cluster aggregation
    pub cluster: Arc<ClusterState>,
    /// Accepted state-response tokens
    pub replay: Arc<ReplayCache>,
    /// Private-app sessions
    pub sessions: Arc<SessionStore>,
    /// Audit/alert sink
    pub events: SharedSink,
    /// Recent-request ring
    pub monitor: Arc<RequestMonitor>,
    /// Load-balancing bookkeeping
    pub balancing: Arc<BalancingState>,
    /// Shared upstream HTTP clients
    pub clients: Arc<UpstreamClients>,
    /// This instance's placement
    pub position: InstancePosition,
    /// Whether this instance aggregates peer stats
    pub leader: bool,
}

impl GatewayEnv {
    /// Build an environment around a datastore with default components.
    pub fn new(datastore: Arc<Datastore>, position: InstancePosition) -> Self {
        let view = datastore.view();
        Self {
            datastore,
            view,
            quotas: Arc::new(QuotaStore::new()),
            stats: Arc::new(LiveStatsRegistry::new()),
            cluster: Arc::new(ClusterState::new()),
            replay: Arc::new(ReplayCache::new()),
            sessions: Arc::new(SessionStore::new()),
            events: Arc::new(TracingSink),
            monitor: Arc::new(RequestMonitor::new(1_000)),
            balancing: Arc::new(BalancingState::new()),
            clients: Arc::new(UpstreamClients::new()),
            position,
            leader: true,
        }
    }

    /// Replace the event sink (builder style).
    pub fn with_events(mut self, events: SharedSink) -> Self {
        self.events = events;
        self
    }
}
