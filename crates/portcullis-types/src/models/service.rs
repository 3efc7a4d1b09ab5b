//! Service descriptors: the virtual services the gateway exposes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::apikey::ApiKeyConstraints;
use super::jwt::{AlgoSettings, JwtVerifier};

/// A configured virtual service, keyed by `(subdomain, env, domain, root)`.
///
/// Two descriptors may share the routing key only if their public/private
/// pattern partitions are disjoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::struct_excessive_bools)]
pub struct ServiceDescriptor {
    /// Stable identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Environment line (e.g. `prod`)
    #[serde(default = "default_env")]
    pub env: String,
    /// Leftmost host label; `*` matches any single label
    pub subdomain: String,
    /// Apex domain the service is exposed under
    pub domain: String,
    /// Path prefix the service owns
    #[serde(default = "default_root")]
    pub root: String,
    /// Upstream endpoints
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Group the service belongs to (API keys authorize against it)
    #[serde(default = "default_group")]
    pub group_id: String,
    /// Path regexes reachable without authentication
    #[serde(default)]
    pub public_patterns: Vec<String>,
    /// Path regexes that always require authentication, overriding public ones
    #[serde(default)]
    pub private_patterns: Vec<String>,
    /// Redirect plain-HTTP calls to HTTPS
    #[serde(default)]
    pub force_https: bool,
    /// Engage the signed state/claim exchange with the upstream
    #[serde(default)]
    pub enforce_secure_communication: bool,
    /// Send the signed state challenge header
    #[serde(default = "default_true")]
    pub send_state_challenge: bool,
    /// Send the signed caller-identity token header
    #[serde(default = "default_true")]
    pub send_info_token: bool,
    /// TTL bound for exchange tokens, in seconds
    #[serde(default = "default_sec_com_ttl")]
    pub sec_com_ttl: u64,
    /// Challenge protocol version
    #[serde(default)]
    pub sec_com_version: SecComVersion,
    /// Shape of the claim/info token
    #[serde(default)]
    pub sec_com_info_token_version: SecComInfoTokenVersion,
    /// Signing settings shared with the upstream
    #[serde(default)]
    pub sec_com_settings: AlgoSettings,
    /// Per-service overrides for the exchange header names
    #[serde(default)]
    pub sec_com_headers: SecComHeaders,
    /// Extra upstream headers; values are template strings
    #[serde(default)]
    pub additional_headers: HashMap<String, String>,
    /// Where and how API keys may be presented
    #[serde(default)]
    pub api_key_constraints: ApiKeyConstraints,
    /// Timeouts and retry budget for upstream calls
    #[serde(default)]
    pub client_config: ClientConfig,
    /// Client IP allow/deny lists
    #[serde(default)]
    pub ip_filtering: IpFiltering,
    /// Target selection discipline
    #[serde(default)]
    pub targets_load_balancing: LoadBalancing,
    /// Optional JWT verification before API-key checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_verifier: Option<ServiceJwtVerifier>,
    /// Method+path allow/forbid/not-found lists
    #[serde(default)]
    pub restrictions: Restrictions,
    /// Auth module reference for the private-app login flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_config_ref: Option<String>,
    /// Gate the whole service behind a private-app session
    #[serde(default)]
    pub private_app: bool,
    /// Overrides the derived `subdomain.domain` exposed domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_domain_override: Option<String>,
}

fn default_env() -> String {
    "prod".to_string()
}

fn default_root() -> String {
    "/".to_string()
}

fn default_group() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sec_com_ttl() -> u64 {
    30
}

impl ServiceDescriptor {
    /// The domain clients use to reach this service.
    pub fn exposed_domain(&self) -> String {
        match &self.exposed_domain_override {
            Some(d) => d.clone(),
            None => format!("{}.{}", self.subdomain, self.domain),
        }
    }

    /// Number of wildcard labels in the routing key, for specificity ordering.
    pub fn wildcard_count(&self) -> usize {
        usize::from(self.subdomain == "*")
    }
}

impl Default for ServiceDescriptor {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            env: default_env(),
            subdomain: String::new(),
            domain: String::new(),
            root: default_root(),
            targets: Vec::new(),
            group_id: "default".to_string(),
            public_patterns: Vec::new(),
            private_patterns: Vec::new(),
            force_https: false,
            enforce_secure_communication: false,
            send_state_challenge: true,
            send_info_token: true,
            sec_com_ttl: default_sec_com_ttl(),
            sec_com_version: SecComVersion::default(),
            sec_com_info_token_version: SecComInfoTokenVersion::default(),
            sec_com_settings: AlgoSettings::default(),
            sec_com_headers: SecComHeaders::default(),
            additional_headers: HashMap::new(),
            api_key_constraints: ApiKeyConstraints::default(),
            client_config: ClientConfig::default(),
            ip_filtering: IpFiltering::default(),
            targets_load_balancing: LoadBalancing::default(),
            jwt_verifier: None,
            restrictions: Restrictions::default(),
            auth_config_ref: None,
            private_app: false,
            exposed_domain_override: None,
        }
    }
}

/// A JWT verifier attached to a service: either inlined or a datastore reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServiceJwtVerifier {
    /// Verifier settings inlined in the descriptor
    Local(JwtVerifier),
    /// Reference to a named verifier, resolved lazily through the config view
    Ref {
        /// Verifier id in the datastore
        id: String,
    },
}

/// A single upstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// `host` or `host:port`
    pub host: String,
    /// http or https
    #[serde(default)]
    pub scheme: TargetScheme,
    /// Relative share in weighted rotations (≥ 1)
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Path prefix prepended when rewriting the request line
    #[serde(default)]
    pub root: String,
    /// Connect to this IP instead of resolving `host`; Host/SNI keep `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Placement predicate evaluated against the instance position
    #[serde(default)]
    pub predicate: TargetPredicate,
}

fn default_weight() -> u32 {
    1
}

impl Target {
    /// Host without the port suffix.
    pub fn hostname(&self) -> &str {
        self.host.split(':').next().unwrap_or(&self.host)
    }

    /// Explicit port, or the scheme default.
    pub fn port(&self) -> u16 {
        self.host
            .split(':')
            .nth(1)
            .and_then(|p| p.parse().ok())
            .unwrap_or(match self.scheme {
                TargetScheme::Http => 80,
                TargetScheme::Https => 443,
            })
    }

    /// Stable identity for bookkeeping (EWMA, retry exclusion).
    pub fn key(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

impl Default for Target {
    fn default() -> Self {
        Self {
            host: String::new(),
            scheme: TargetScheme::default(),
            weight: 1,
            root: String::new(),
            ip_address: None,
            predicate: TargetPredicate::default(),
        }
    }
}

/// Upstream scheme.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetScheme {
    /// Plain HTTP
    Http,
    /// TLS
    #[default]
    Https,
}

impl std::fmt::Display for TargetScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetScheme::Http => write!(f, "http"),
            TargetScheme::Https => write!(f, "https"),
        }
    }
}

/// Placement predicate deciding whether a target is eligible from this instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TargetPredicate {
    /// Always eligible
    #[default]
    AllMatch,
    /// Eligible when the instance runs in this region
    RegionMatch {
        /// Required region
        region: String,
    },
    /// Eligible when the instance runs in this zone
    ZoneMatch {
        /// Required zone
        zone: String,
    },
    /// Eligible when both region and zone match
    RegionAndZoneMatch {
        /// Required region
        region: String,
        /// Required zone
        zone: String,
    },
    /// Structured placement match; unset fields are wildcards
    NetworkLocation {
        /// Infrastructure provider
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        /// Region
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        /// Zone
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zone: Option<String>,
        /// Data center
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_center: Option<String>,
        /// Rack
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rack: Option<String>,
    },
}

/// Target selection discipline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LoadBalancing {
    /// Weight-expanded rotation driven by a per-service counter
    #[default]
    RoundRobin,
    /// Uniform pick over the weight-expanded list
    Random,
    /// Deterministic pick keyed by the tracking cookie
    Sticky,
    /// Deterministic pick keyed by the client IP
    IpAddressHash,
    /// Lowest exponentially-weighted average response time
    BestResponseTime,
    /// Best response time with probability `ratio`, else uniform among the rest
    WeightedBestResponseTime {
        /// Probability of picking the current best target, in (0, 1]
        ratio: f64,
    },
}

/// Versions of the state challenge protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SecComVersion {
    /// Fire-and-forget challenge; the response token is not validated
    V1,
    /// Challenge/response: the upstream must echo the state in a signed token
    #[default]
    V2,
}

/// Shapes of the claim/info token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SecComInfoTokenVersion {
    /// Flat v1 claim set (`email`, `name`, `app_metadata`, `user_metadata`)
    Legacy,
    /// Nested claim set with `access_type` and an `apikey` object
    #[default]
    Latest,
}

/// Per-service overrides for the exchange header names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecComHeaders {
    /// Header carrying the claim token (default `Otoroshi-Claim`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_request_name: Option<String>,
    /// Header carrying the state token (default `Otoroshi-State`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_request_name: Option<String>,
    /// Response header carrying the state echo (default `Otoroshi-State-Resp`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_response_name: Option<String>,
}

/// Timeouts and retry budget for upstream calls. All durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Maximum time to obtain the upstream status line
    #[serde(default = "default_call_timeout")]
    pub call_timeout: u64,
    /// Maximum idle gap on the response body stream
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Maximum total time from dispatch to body completion
    #[serde(default = "default_call_and_stream_timeout")]
    pub call_and_stream_timeout: u64,
    /// Per-request upper bound across retries
    #[serde(default = "default_global_timeout")]
    pub global_timeout: u64,
    /// TCP/TLS connect budget
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Attempts per request; each attempt uses a fresh target
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_call_timeout() -> u64 {
    30_000
}

fn default_idle_timeout() -> u64 {
    60_000
}

fn default_call_and_stream_timeout() -> u64 {
    120_000
}

fn default_global_timeout() -> u64 {
    30_000
}

fn default_connection_timeout() -> u64 {
    10_000
}

fn default_retries() -> u32 {
    1
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: default_call_timeout(),
            idle_timeout: default_idle_timeout(),
            call_and_stream_timeout: default_call_and_stream_timeout(),
            global_timeout: default_global_timeout(),
            connection_timeout: default_connection_timeout(),
            retries: default_retries(),
        }
    }
}

/// Client IP allow/deny lists. Entries are exact IPs, `a.b.c.*` wildcards, or CIDR blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IpFiltering {
    /// When non-empty, only these clients are admitted
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Clients rejected outright
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl IpFiltering {
    /// Whether any rule is configured.
    pub fn is_empty(&self) -> bool {
        self.whitelist.is_empty() && self.blacklist.is_empty()
    }
}

/// Method+path allow/forbid/not-found lists evaluated before authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Restrictions {
    /// Master switch
    #[serde(default)]
    pub enabled: bool,
    /// Evaluate forbidden/notFound before allowed
    #[serde(default)]
    pub allow_last: bool,
    /// Entries admitted outright
    #[serde(default)]
    pub allowed: Vec<RestrictionPath>,
    /// Entries rejected with 403
    #[serde(default)]
    pub forbidden: Vec<RestrictionPath>,
    /// Entries rejected with 404
    #[serde(default)]
    pub not_found: Vec<RestrictionPath>,
}

/// One restriction entry. Method `*` matches any; the path regex is anchored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestrictionPath {
    /// HTTP method or `*`
    #[serde(default = "default_method")]
    pub method: String,
    /// Anchored path regex
    pub path: String,
}

fn default_method() -> String {
    "*".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposed_domain_is_derived_unless_overridden() {
        let mut svc = ServiceDescriptor {
            subdomain: "api".into(),
            domain: "oto.tools".into(),
            ..Default::default()
        };
        assert_eq!(svc.exposed_domain(), "api.oto.tools");
        svc.exposed_domain_override = Some("edge.example.com".into());
        assert_eq!(svc.exposed_domain(), "edge.example.com");
    }

    #[test]
    fn target_host_port_parsing() {
        let t = Target { host: "backend.local:8443".into(), ..Default::default() };
        assert_eq!(t.hostname(), "backend.local");
        assert_eq!(t.port(), 8443);

        let t = Target {
            host: "backend.local".into(),
            scheme: TargetScheme::Http,
            ..Default::default()
        };
        assert_eq!(t.port(), 80);
    }

    #[test]
    fn descriptor_round_trips_with_camel_case_fields() {
        let svc = ServiceDescriptor {
            id: "svc-1".into(),
            name: "payments".into(),
            subdomain: "pay".into(),
            domain: "oto.tools".into(),
            force_https: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&svc).unwrap();
        assert_eq!(json["forceHttps"], true);
        assert_eq!(json["secComVersion"], "V2");
        let back: ServiceDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, svc);
    }

    #[test]
    fn load_balancing_tagged_serialization() {
        let lb = LoadBalancing::WeightedBestResponseTime { ratio: 0.7 };
        let json = serde_json::to_value(&lb).unwrap();
        assert_eq!(json["type"], "weightedBestResponseTime");
        assert_eq!(json["ratio"], 0.7);
    }
}
