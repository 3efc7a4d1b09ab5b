//! API keys and the constraints services place on them.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// An API key authorized against a service group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    /// Public identifier
    pub client_id: String,
    /// Shared secret; signs bearer tokens and basic-auth pairs
    pub client_secret: String,
    /// Display name
    pub client_name: String,
    /// Group this key may call
    pub authorized_group: String,
    /// Disabled keys are rejected as invalid
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Free-form tags used by routing matchers
    #[serde(default)]
    pub tags: HashSet<String>,
    /// Free-form metadata used by routing matchers and header templates
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Calls per second over a 1-second rolling window
    #[serde(default = "default_throttling_quota")]
    pub throttling_quota: u64,
    /// Calls per calendar day
    #[serde(default = "default_large_quota")]
    pub daily_quota: u64,
    /// Calls per calendar month
    #[serde(default = "default_large_quota")]
    pub monthly_quota: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_throttling_quota() -> u64 {
    10_000_000
}

fn default_large_quota() -> u64 {
    10_000_000
}

impl Default for ApiKey {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            client_name: String::new(),
            authorized_group: "default".to_string(),
            enabled: true,
            tags: HashSet::new(),
            metadata: HashMap::new(),
            throttling_quota: default_throttling_quota(),
            daily_quota: default_large_quota(),
            monthly_quota: default_large_quota(),
        }
    }
}

/// Tag/metadata matcher routing keys between services that share a host.
///
/// An empty matcher accepts every key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRouteMatcher {
    /// Key must carry at least one of these tags
    #[serde(default)]
    pub one_tag_in: Vec<String>,
    /// Key must carry every one of these tags
    #[serde(default)]
    pub all_tags_in: Vec<String>,
    /// At least one of these pairs must be present in the key metadata
    #[serde(default)]
    pub one_meta_in: HashMap<String, String>,
    /// All of these pairs must be present in the key metadata
    #[serde(default)]
    pub all_meta_in: HashMap<String, String>,
}

impl ApiKeyRouteMatcher {
    /// Whether no constraint is configured.
    pub fn is_empty(&self) -> bool {
        self.one_tag_in.is_empty()
            && self.all_tags_in.is_empty()
            && self.one_meta_in.is_empty()
            && self.all_meta_in.is_empty()
    }

    /// Evaluate the matcher against a key's tags and metadata.
    pub fn matches(&self, key: &ApiKey) -> bool {
        let one_tag = self.one_tag_in.is_empty()
            || self.one_tag_in.iter().any(|t| key.tags.contains(t));
        let all_tags = self.all_tags_in.iter().all(|t| key.tags.contains(t));
        let one_meta = self.one_meta_in.is_empty()
            || self
                .one_meta_in
                .iter()
                .any(|(k, v)| key.metadata.get(k).is_some_and(|mv| mv == v));
        let all_meta = self
            .all_meta_in
            .iter()
            .all(|(k, v)| key.metadata.get(k).is_some_and(|mv| mv == v));
        one_tag && all_tags && one_meta && all_meta
    }
}

/// Where and how a service accepts API keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyConstraints {
    /// Tag/metadata routing matcher
    #[serde(default)]
    pub routing: ApiKeyRouteMatcher,
    /// Signed bearer token extraction
    #[serde(default)]
    pub jwt_auth: JwtAuthConstraints,
    /// `Authorization: Basic` extraction
    #[serde(default)]
    pub basic_auth: BasicAuthConstraints,
    /// Client-id/client-secret header pair extraction
    #[serde(default)]
    pub custom_headers_auth: CustomHeadersAuthConstraints,
}

/// Bearer-token extraction settings. The token is a JWT signed with the client secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JwtAuthConstraints {
    /// Master switch
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Header holding `Otoroshi-Token <jwt>` (default `Authorization`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    /// Query parameter fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_name: Option<String>,
    /// Cookie fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_name: Option<String>,
}

impl Default for JwtAuthConstraints {
    fn default() -> Self {
        Self { enabled: true, header_name: None, query_name: None, cookie_name: None }
    }
}

/// `Authorization: Basic base64(clientId:clientSecret)` extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthConstraints {
    /// Master switch
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Header to read (default `Authorization`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
}

impl Default for BasicAuthConstraints {
    fn default() -> Self {
        Self { enabled: true, header_name: None }
    }
}

/// Plain header-pair extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CustomHeadersAuthConstraints {
    /// Master switch
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Header carrying the client id (default `Otoroshi-Client-Id`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_header_name: Option<String>,
    /// Header carrying the client secret (default `Otoroshi-Client-Secret`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_header_name: Option<String>,
}

impl Default for CustomHeadersAuthConstraints {
    fn default() -> Self {
        Self { enabled: true, client_id_header_name: None, client_secret_header_name: None }
    }
}
