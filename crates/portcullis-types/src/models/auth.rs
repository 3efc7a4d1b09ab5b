//! Auth modules for the private-app login flow, and the sessions they mint.
//!
//! Concrete identity providers are external collaborators; the core only
//! stores their configuration as tagged variants and consumes the sessions
//! they create.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration of an identity module, opaque to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthModuleConfig {
    /// In-config username/password store
    Basic {
        /// Stable identifier
        id: String,
        /// Display name
        name: String,
        /// Session lifetime in seconds
        #[serde(default = "default_session_max_age")]
        session_max_age: u64,
        /// Provider-specific settings, uninterpreted by the core
        #[serde(default)]
        settings: serde_json::Value,
    },
    /// OAuth2 / OIDC provider
    Oauth2 {
        /// Stable identifier
        id: String,
        /// Display name
        name: String,
        /// Session lifetime in seconds
        #[serde(default = "default_session_max_age")]
        session_max_age: u64,
        /// Provider-specific settings, uninterpreted by the core
        #[serde(default)]
        settings: serde_json::Value,
    },
    /// LDAP directory
    Ldap {
        /// Stable identifier
        id: String,
        /// Display name
        name: String,
        /// Session lifetime in seconds
        #[serde(default = "default_session_max_age")]
        session_max_age: u64,
        /// Provider-specific settings, uninterpreted by the core
        #[serde(default)]
        settings: serde_json::Value,
    },
    /// WebAuthn / passkeys
    WebAuthn {
        /// Stable identifier
        id: String,
        /// Display name
        name: String,
        /// Session lifetime in seconds
        #[serde(default = "default_session_max_age")]
        session_max_age: u64,
        /// Provider-specific settings, uninterpreted by the core
        #[serde(default)]
        settings: serde_json::Value,
    },
}

fn default_session_max_age() -> u64 {
    86_400
}

impl AuthModuleConfig {
    /// Stable identifier regardless of variant.
    pub fn id(&self) -> &str {
        match self {
            AuthModuleConfig::Basic { id, .. }
            | AuthModuleConfig::Oauth2 { id, .. }
            | AuthModuleConfig::Ldap { id, .. }
            | AuthModuleConfig::WebAuthn { id, .. } => id,
        }
    }

    /// Session lifetime in seconds regardless of variant.
    pub fn session_max_age(&self) -> u64 {
        match self {
            AuthModuleConfig::Basic { session_max_age, .. }
            | AuthModuleConfig::Oauth2 { session_max_age, .. }
            | AuthModuleConfig::Ldap { session_max_age, .. }
            | AuthModuleConfig::WebAuthn { session_max_age, .. } => *session_max_age,
        }
    }
}

/// A logged-in private-app user. Owned by the session store; destroyed on
/// expiry or explicit logout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrivateAppsUser {
    /// Opaque session id, carried by the `oto-papps-*` cookie
    pub random_id: String,
    /// Display name
    pub name: String,
    /// Email address
    pub email: String,
    /// Provider profile, uninterpreted
    #[serde(default)]
    pub profile: serde_json::Value,
    /// Realm (auth module) that minted the session
    #[serde(default)]
    pub realm: String,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Expiry instant
    pub expired_at: DateTime<Utc>,
}

impl PrivateAppsUser {
    /// Whether the session is still live at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expired_at > now
    }
}
