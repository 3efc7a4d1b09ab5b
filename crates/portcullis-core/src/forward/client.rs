//! Shared upstream HTTP clients.
//!
//! One pooled client serves every target; targets carrying a DNS override get
//! a dedicated client whose resolver pins the hostname to the configured IP
//! (Host header and TLS SNI keep the configured hostname). Override clients
//! are cached per `(host, ip)`.

use dashmap::DashMap;
use portcullis_types::models::Target;
use reqwest::Client;
use std::net::SocketAddr;
use tokio::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_MAX_IDLE_PER_HOST: usize = 16;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

fn base_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        // the gateway relays redirects to the client, it never follows them
        .redirect(reqwest::redirect::Policy::none())
}

/// Process-wide client pool, shared by every service.
pub struct UpstreamClients {
    default: Client,
    resolved: DashMap<String, Client>,
}

impl UpstreamClients {
    /// Build the shared pool.
    #[allow(clippy::expect_used, reason = "an HTTP client is required for the gateway to function")]
    pub fn new() -> Self {
        let default = base_builder().build().expect("failed to build the upstream HTTP client");
        Self { default, resolved: DashMap::new() }
    }

    /// Client for one target; cheap (`reqwest::Client` clones share the pool).
    pub fn client_for(&self, target: &Target) -> Client {
        let Some(ref ip) = target.ip_address else {
            return self.default.clone();
        };
        let addr: SocketAddr = match format!("{}:{}", ip, target.port()).parse() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(
                    "target {}: invalid ip override {:?} ({}), resolving normally",
                    target.host,
                    ip,
                    e
                );
                return self.default.clone();
            }
        };
        let cache_key = format!("{}|{}", target.host, ip);
        if let Some(client) = self.resolved.get(&cache_key) {
            return client.clone();
        }
        match base_builder().resolve(target.hostname(), addr).build() {
            Ok(client) => {
                self.resolved.insert(cache_key, client.clone());
                client
            }
            Err(e) => {
                tracing::warn!("failed to build resolver-override client: {}", e);
                self.default.clone()
            }
        }
    }
}

impl Default for UpstreamClients {
    fn default() -> Self {
        Self::new()
    }
}
