//! The access gate: ordered checks between routing and target selection.
//!
//! Check order, first failure short-circuiting: IP filter, restrictions,
//! public short-circuit, JWT verifier, API-key extraction/validation, routing
//! constraints, quotas, private-app session. Successes attach the key and the
//! user to the admission for downstream hooks (claim tokens, header
//! templates, telemetry).

pub mod apikey;
pub mod ip_filter;
pub mod jwt;
pub mod restrictions;

use crate::sessions::SessionStore;
use crate::store::quotas::{QuotaStore, RemainingQuotas};
use crate::store::{CompiledService, ConfigSnapshot};
use portcullis_types::error::{GatewayError, GatewayResult};
use portcullis_types::models::{ApiKey, PrivateAppsUser, ServiceJwtVerifier};
use std::collections::HashMap;

/// Cookie prefix of private-app sessions.
pub const PRIVATE_APP_COOKIE_PREFIX: &str = "oto-papps-";

/// The request facts the gate consumes, decoupled from the HTTP layer.
pub struct AccessRequest<'a> {
    /// Uppercase HTTP method
    pub method: &'a str,
    /// Full original path
    pub path: &'a str,
    /// Headers, lowercased names, first value per name
    pub headers: &'a HashMap<String, String>,
    /// Query parameters
    pub query: &'a HashMap<String, String>,
    /// Cookies
    pub cookies: &'a HashMap<String, String>,
    /// Resolved client IP
    pub client_ip: &'a str,
}

/// What an admitted request carries into the forwarding stage.
#[derive(Debug, Default)]
pub struct Admission {
    /// API key that authenticated the call, if any
    pub apikey: Option<ApiKey>,
    /// Private-app user bound to the call, if any
    pub user: Option<PrivateAppsUser>,
    /// Quota allowance left after this call, when a key was charged
    pub remaining: Option<RemainingQuotas>,
}

/// Run every gate stage for one request against its matched service.
pub fn run(
    snapshot: &ConfigSnapshot,
    service: &CompiledService,
    is_public: bool,
    req: &AccessRequest<'_>,
    quotas: &QuotaStore,
    sessions: &SessionStore,
) -> GatewayResult<Admission> {
    let descriptor = &service.descriptor;

    ip_filter::check(&descriptor.ip_filtering, req.client_ip)?;
    restrictions::check(service, req.method, req.path)?;

    if is_public {
        return Ok(Admission::default());
    }

    let mut jwt_verified = false;
    if let Some(configured) = &descriptor.jwt_verifier {
        let outcome = match configured {
            ServiceJwtVerifier::Local(verifier) => jwt::check(verifier, req)?,
            ServiceJwtVerifier::Ref { id } => match snapshot.verifiers.get(id) {
                Some(verifier) => jwt::check(verifier, req)?,
                None => {
                    tracing::warn!(
                        "service {}: jwt verifier {} not found, skipping stage",
                        descriptor.id,
                        id
                    );
                    jwt::JwtOutcome::Skipped
                }
            },
        };
        jwt_verified = outcome == jwt::JwtOutcome::Verified;
    }

    if let Some(key) = apikey::check(snapshot, descriptor, req)? {
        if !descriptor.api_key_constraints.routing.matches(&key) {
            return Err(GatewayError::ApiKeyRouting);
        }
        let remaining = quotas
            .consume(&key)
            .map_err(|dimension| GatewayError::QuotaExceeded { dimension })?;
        return Ok(Admission { apikey: Some(key), user: None, remaining: Some(remaining) });
    }

    if descriptor.private_app {
        if let Some(user) = private_app_session(req, sessions) {
            return Ok(Admission { apikey: None, user: Some(user), remaining: None });
        }
        return Err(GatewayError::AuthRequired {
            message: "private app session required".to_string(),
        });
    }

    // a fully verified inbound JWT authenticates the caller on its own
    if jwt_verified {
        return Ok(Admission::default());
    }

    Err(GatewayError::AuthRequired { message: "no credentials supplied".to_string() })
}

/// First live session referenced by an `oto-papps-*` cookie.
fn private_app_session(
    req: &AccessRequest<'_>,
    sessions: &SessionStore,
) -> Option<PrivateAppsUser> {
    req.cookies
        .iter()
        .filter(|(name, _)| name.starts_with(PRIVATE_APP_COOKIE_PREFIX))
        .find_map(|(_, session_id)| sessions.get(session_id))
}
