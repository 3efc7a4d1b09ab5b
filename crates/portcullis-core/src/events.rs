//! Audit/alert event publishing.
//!
//! Sinks are fire-and-forget: `publish` must return quickly and must never
//! fail the request. Different deployments plug in different transports; the
//! default sink writes structured logs.

use chrono::{DateTime, Utc};
use portcullis_types::GatewayError;
use serde::Serialize;
use std::sync::Arc;

/// An event emitted by the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GatewayEvent {
    /// A request passed the access gate and was dispatched upstream.
    CallAdmitted {
        /// Service id
        service: String,
        /// API-key client id, when one authenticated the call
        client_id: Option<String>,
        /// Event instant
        at: DateTime<Utc>,
    },
    /// A request was rejected before reaching any target.
    CallDenied {
        /// Service id when resolution succeeded
        service: Option<String>,
        /// Stable error identifier
        error: String,
        /// Client IP
        ip: String,
        /// Event instant
        at: DateTime<Utc>,
    },
    /// An upstream attempt failed (may be retried).
    UpstreamFailure {
        /// Service id
        service: String,
        /// Target key
        target: String,
        /// Stable error identifier
        error: String,
        /// Event instant
        at: DateTime<Utc>,
    },
    /// A request completed and was reported.
    CallFinished {
        /// Service id
        service: String,
        /// Upstream status surfaced to the client
        status: u16,
        /// Total duration in milliseconds
        duration_ms: u64,
        /// Gateway overhead in milliseconds
        overhead_ms: u64,
        /// Event instant
        at: DateTime<Utc>,
    },
}

impl GatewayEvent {
    /// A denial event for `err`.
    pub fn denied(service: Option<&str>, err: &GatewayError, ip: &str) -> Self {
        GatewayEvent::CallDenied {
            service: service.map(str::to_string),
            error: err.kind().to_string(),
            ip: ip.to_string(),
            at: Utc::now(),
        }
    }
}

/// Transport for gateway events.
pub trait EventSink: Send + Sync {
    /// Publish one event. Must not block and must not fail the caller.
    fn publish(&self, event: GatewayEvent);
}

/// Sink that drops everything.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: GatewayEvent) {}
}

/// Default sink: structured log lines.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: GatewayEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "portcullis::audit", "{}", json),
            // a sink failure is logged and swallowed, never propagated
            Err(e) => tracing::warn!("failed to serialize audit event: {}", e),
        }
    }
}

/// Shared handle used by the pipeline.
pub type SharedSink = Arc<dyn EventSink>;
