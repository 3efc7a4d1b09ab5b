//! Site-wide configuration and certificate records.

use serde::{Deserialize, Serialize};

/// Site-wide defaults consumed by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Environment lines served by this deployment; the first is the default
    /// line, whose services are reachable without the env label in the host.
    #[serde(default = "default_lines")]
    pub lines: Vec<String>,
    /// Auth module used by the back office (consumed by external collaborators)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_office_auth_ref: Option<String>,
    /// Master switch for the live metrics endpoint
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Query-string key gating the metrics endpoint; unset means open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_access_key: Option<String>,
    /// Trust the leftmost `X-Forwarded-For` entry as the client IP
    #[serde(default = "default_true")]
    pub trust_x_forwarded_for: bool,
    /// Newly created API keys join the default group automatically
    #[serde(default)]
    pub auto_link_to_default_group: bool,
    /// Chaos-testing configuration, opaque to the core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snow_monkey_config: Option<serde_json::Value>,
}

fn default_lines() -> Vec<String> {
    vec!["prod".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            lines: default_lines(),
            back_office_auth_ref: None,
            metrics_enabled: true,
            metrics_access_key: None,
            trust_x_forwarded_for: true,
            auto_link_to_default_group: false,
            snow_monkey_config: None,
        }
    }
}

impl GlobalConfig {
    /// The default environment line (`prod` unless configured otherwise).
    pub fn default_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("prod")
    }
}

/// A stored certificate. Chains reference their issuer by id; the config view
/// resolves references lazily, never embedding parent certificates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    /// Stable identifier
    pub id: String,
    /// PEM certificate chain
    pub chain: String,
    /// PEM private key
    #[serde(default)]
    pub private_key: String,
    /// Issuing certificate, when part of a chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_ref: Option<String>,
    /// Domain the certificate serves
    #[serde(default)]
    pub domain: String,
}
