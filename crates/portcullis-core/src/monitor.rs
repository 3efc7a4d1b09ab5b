//! Request monitoring.
//!
//! Keeps a bounded ring of recently completed (or denied) calls for the
//! operator surfaces. Purely observational: logging can be switched off at
//! runtime and never affects the request outcome.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// One completed or rejected call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLog {
    /// Completion instant
    pub at: DateTime<Utc>,
    /// Service id, when resolution succeeded
    pub service: Option<String>,
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Status surfaced to the client
    pub status: u16,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Gateway overhead in milliseconds
    pub overhead_ms: u64,
    /// Resolved client IP
    pub client_ip: String,
}

/// Bounded ring of recent request logs.
pub struct RequestMonitor {
    enabled: AtomicBool,
    logs: RwLock<VecDeque<RequestLog>>,
    max_logs: usize,
}

impl RequestMonitor {
    /// Create a monitor keeping at most `max_logs` entries.
    pub fn new(max_logs: usize) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            logs: RwLock::new(VecDeque::with_capacity(max_logs.min(1024))),
            max_logs,
        }
    }

    /// Whether logging is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Toggle logging at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Append one log entry, evicting the oldest past capacity.
    pub async fn log_request(&self, log: RequestLog) {
        if !self.is_enabled() {
            return;
        }
        let mut logs = self.logs.write().await;
        if logs.len() >= self.max_logs {
            let excess = logs.len() - self.max_logs + 1;
            logs.drain(..excess);
        }
        logs.push_back(log);
    }

    /// Most recent entries first, up to `limit`.
    pub async fn get_logs(&self, limit: Option<usize>) -> Vec<RequestLog> {
        let logs = self.logs.read().await;
        let limit = limit.unwrap_or(logs.len());
        logs.iter().rev().take(limit).cloned().collect()
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.logs.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(path: &str, status: u16) -> RequestLog {
        RequestLog {
            at: Utc::now(),
            service: Some("svc".into()),
            method: "GET".into(),
            path: path.into(),
            status,
            duration_ms: 12,
            overhead_ms: 2,
            client_ip: "10.0.0.1".into(),
        }
    }

    #[tokio::test]
    async fn ring_keeps_the_most_recent_entries() {
        let monitor = RequestMonitor::new(3);
        for i in 0..5 {
            monitor.log_request(log(&format!("/r{i}"), 200)).await;
        }
        let logs = monitor.get_logs(None).await;
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].path, "/r4");
        assert_eq!(logs[2].path, "/r2");
    }

    #[tokio::test]
    async fn disabled_monitor_records_nothing() {
        let monitor = RequestMonitor::new(10);
        monitor.set_enabled(false);
        monitor.log_request(log("/x", 200)).await;
        assert!(monitor.get_logs(None).await.is_empty());

        monitor.set_enabled(true);
        monitor.log_request(log("/x", 429)).await;
        assert_eq!(monitor.get_logs(Some(1)).await[0].status, 429);
    }
}
