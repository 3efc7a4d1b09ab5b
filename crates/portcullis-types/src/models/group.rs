//! Service groups: the authorization boundary between API keys and services.

use serde::{Deserialize, Serialize};

/// A named set of services. API keys authorize against a group, never a
/// single service; services and keys reference groups by id only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceGroup {
    /// Stable identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}
