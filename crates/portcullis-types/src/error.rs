//! Gateway error taxonomy.
//!
//! Every failure surfaced to a client carries a stable identifier (returned as
//! the JSON `error` field) and a fixed HTTP status. Upstream failures are the
//! only retryable kind: the pipeline iterates over remaining targets until
//! `ClientConfig::retries` is exhausted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors produced by the request pipeline.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
#[non_exhaustive]
pub enum GatewayError {
    /// No service descriptor matches the requested host+path.
    #[error("no service found for host {host}")]
    ServiceNotFound {
        /// The host that failed to resolve
        host: String,
    },

    /// Client IP rejected by the service's whitelist/blacklist.
    #[error("ip address {ip} is not allowed")]
    IpBlocked {
        /// The rejected client IP
        ip: String,
    },

    /// Request matched a `forbidden` restriction entry.
    #[error("access to {path} is forbidden")]
    RestrictionForbidden {
        /// The forbidden path
        path: String,
    },

    /// Request matched a `notFound` restriction entry.
    #[error("resource {path} does not exist")]
    RestrictionNotFound {
        /// The hidden path
        path: String,
    },

    /// Private request carried no usable credentials.
    #[error("authentication required: {message}")]
    AuthRequired {
        /// What was missing
        message: String,
    },

    /// JWT verification failed (bad signature, missing claim, strict-mode miss).
    #[error("token verification failed: {message}")]
    BadToken {
        /// What failed during verification
        message: String,
    },

    /// API key missing, unknown, disabled, or not authorized for the group.
    #[error("invalid api key: {message}")]
    ApiKeyInvalid {
        /// Why the key was rejected
        message: String,
    },

    /// API key does not satisfy the service's routing constraints.
    /// Deliberately indistinguishable from "no such service for this key".
    #[error("no service available for this api key")]
    ApiKeyRouting,

    /// One of the three quota dimensions is exhausted.
    #[error("quota exceeded: {dimension}")]
    QuotaExceeded {
        /// Which quota dimension failed
        dimension: QuotaDimension,
    },

    /// Could not open a connection to the selected target.
    #[error("upstream connection failed: {message}")]
    UpstreamConnect {
        /// Connection error detail
        message: String,
    },

    /// The target did not answer within the configured timeout.
    #[error("upstream timed out: {message}")]
    UpstreamTimeout {
        /// Which timeout expired
        message: String,
    },

    /// The target's state-response token was missing, malformed, expired or replayed.
    #[error("upstream state token invalid: {message}")]
    UpstreamTokenInvalid {
        /// Validation failure detail
        message: String,
    },

    /// Unclassified pipeline failure.
    #[error("internal error: {message}")]
    Internal {
        /// Error detail
        message: String,
    },
}

/// The quota dimension that rejected a call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum QuotaDimension {
    /// Calls-per-second throttle (1-second rolling window)
    PerSecond,
    /// Calendar-day quota
    Daily,
    /// Calendar-month quota
    Monthly,
}

impl std::fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaDimension::PerSecond => write!(f, "throttling quota"),
            QuotaDimension::Daily => write!(f, "daily quota"),
            QuotaDimension::Monthly => write!(f, "monthly quota"),
        }
    }
}

impl GatewayError {
    /// Stable identifier returned as the JSON `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ServiceNotFound { .. } => "errors.service.not.found",
            GatewayError::IpBlocked { .. } => "errors.ip.blocked",
            GatewayError::RestrictionForbidden { .. } => "errors.restriction.forbidden",
            GatewayError::RestrictionNotFound { .. } => "errors.restriction.not.found",
            GatewayError::AuthRequired { .. } => "errors.auth.required",
            GatewayError::BadToken { .. } => "error.bad.token",
            GatewayError::ApiKeyInvalid { .. } => "errors.apikey.invalid",
            GatewayError::ApiKeyRouting => "errors.apikey.routing",
            GatewayError::QuotaExceeded { .. } => "errors.quota.exceeded",
            GatewayError::UpstreamConnect { .. } => "errors.upstream.connect",
            GatewayError::UpstreamTimeout { .. } => "errors.upstream.timeout",
            GatewayError::UpstreamTokenInvalid { .. } => "errors.upstream.token.invalid",
            GatewayError::Internal { .. } => "errors.internal",
        }
    }

    /// HTTP status the error maps to.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::ServiceNotFound { .. } => 404,
            GatewayError::IpBlocked { .. } => 403,
            GatewayError::RestrictionForbidden { .. } => 403,
            GatewayError::RestrictionNotFound { .. } => 404,
            GatewayError::AuthRequired { .. } => 401,
            GatewayError::BadToken { .. } => 400,
            GatewayError::ApiKeyInvalid { .. } => 401,
            GatewayError::ApiKeyRouting => 404,
            GatewayError::QuotaExceeded { .. } => 429,
            GatewayError::UpstreamConnect { .. } => 502,
            GatewayError::UpstreamTimeout { .. } => 502,
            GatewayError::UpstreamTokenInvalid { .. } => 502,
            GatewayError::Internal { .. } => 500,
        }
    }

    /// Whether the pipeline may retry this failure against another target.
    ///
    /// Only upstream failures are retryable; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamConnect { .. }
                | GatewayError::UpstreamTimeout { .. }
                | GatewayError::UpstreamTokenInvalid { .. }
        )
    }

    /// JSON body sent to the client.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind(),
            "error_description": self.to_string(),
        })
    }
}
