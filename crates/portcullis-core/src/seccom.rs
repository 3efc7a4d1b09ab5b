//! Signed state/claim exchange with upstreams.
//!
//! When a service enforces secure communication, every private call carries a
//! short-lived signed state token (and optionally a caller-identity claim
//! token). In V2 the upstream must echo the state back in its own signed
//! token; the echo is checked for signature, state equality, expiry, declared
//! TTL and replay before the response is surfaced to the client.

use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use portcullis_types::error::{GatewayError, GatewayResult};
use portcullis_types::models::{
    ApiKey, PrivateAppsUser, SecComInfoTokenVersion, SecComVersion, ServiceDescriptor,
};
use portcullis_types::AlgoSettings;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Default header names of the exchange, overridable per service.
pub const DEFAULT_STATE_HEADER: &str = "Otoroshi-State";
/// Default claim header name.
pub const DEFAULT_CLAIM_HEADER: &str = "Otoroshi-Claim";
/// Default state-response header name.
pub const DEFAULT_STATE_RESP_HEADER: &str = "Otoroshi-State-Resp";

/// Issuer put in every token the gateway signs.
const TOKEN_ISSUER: &str = "portcullis";

/// Phases of one exchange attempt against one target.
/// `Rejected` and `Timeout` attempts are retryable by the forwarding loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    /// Created, nothing signed yet
    Ready,
    /// State/claim tokens signed
    TokensIssued,
    /// Request dispatched upstream
    Sent,
    /// Response headers received, echo not yet checked
    Awaiting,
    /// Echo validated
    Verified,
    /// Echo missing or invalid
    Rejected,
    /// The attempt timed out before an echo arrived
    Timeout,
    /// Outcome recorded in telemetry
    Reported,
}

/// One state/claim exchange bound to a single upstream attempt.
#[derive(Debug, Clone)]
pub struct SecComExchange {
    /// Random state value the upstream must echo
    pub state: String,
    /// Signed state token, when the service sends the challenge
    pub state_token: Option<String>,
    /// Signed caller-identity token, when the service sends it
    pub claim_token: Option<String>,
    /// Current phase
    pub phase: ExchangePhase,
}

impl SecComExchange {
    /// Advance the phase.
    pub fn advance(&mut self, phase: ExchangePhase) {
        self.phase = phase;
    }
}

/// The authenticated caller described by the claim token.
pub struct CallerIdentity<'a> {
    /// API key that admitted the call
    pub apikey: Option<&'a ApiKey>,
    /// Private-app user bound to the call
    pub user: Option<&'a PrivateAppsUser>,
}

/// Map algorithm settings to a `jsonwebtoken` algorithm.
pub fn algorithm_for(settings: &AlgoSettings) -> GatewayResult<Algorithm> {
    let alg = match settings {
        AlgoSettings::Hmac { size: 256, .. } => Algorithm::HS256,
        AlgoSettings::Hmac { size: 384, .. } => Algorithm::HS384,
        AlgoSettings::Hmac { size: 512, .. } => Algorithm::HS512,
        AlgoSettings::Rsa { size: 256, .. } => Algorithm::RS256,
        AlgoSettings::Rsa { size: 384, .. } => Algorithm::RS384,
        AlgoSettings::Rsa { size: 512, .. } => Algorithm::RS512,
        AlgoSettings::Es { size: 256, .. } => Algorithm::ES256,
        AlgoSettings::Es { size: 384, .. } => Algorithm::ES384,
        other => {
            return Err(GatewayError::Internal {
                message: format!("unsupported algorithm size in {other:?}"),
            })
        }
    };
    Ok(alg)
}

/// Build the signing key from algorithm settings.
pub fn encoding_key_for(settings: &AlgoSettings) -> GatewayResult<EncodingKey> {
    match settings {
        AlgoSettings::Hmac { secret, .. } => Ok(EncodingKey::from_secret(secret.as_bytes())),
        AlgoSettings::Rsa { private_key: Some(pem), .. } => EncodingKey::from_rsa_pem(
            pem.as_bytes(),
        )
        .map_err(|e| GatewayError::Internal { message: format!("bad RSA private key: {e}") }),
        AlgoSettings::Es { private_key: Some(pem), .. } => EncodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| GatewayError::Internal { message: format!("bad EC private key: {e}") }),
        _ => Err(GatewayError::Internal {
            message: "asymmetric signing requires a private key".to_string(),
        }),
    }
}

/// Build the verification key from algorithm settings.
pub fn decoding_key_for(settings: &AlgoSettings) -> GatewayResult<DecodingKey> {
    match settings {
        AlgoSettings::Hmac { secret, .. } => Ok(DecodingKey::from_secret(secret.as_bytes())),
        AlgoSettings::Rsa { public_key, .. } => DecodingKey::from_rsa_pem(public_key.as_bytes())
            .map_err(|e| GatewayError::Internal { message: format!("bad RSA public key: {e}") }),
        AlgoSettings::Es { public_key, .. } => DecodingKey::from_ec_pem(public_key.as_bytes())
            .map_err(|e| GatewayError::Internal { message: format!("bad EC public key: {e}") }),
    }
}

/// Header carrying the state token for this service.
pub fn state_header_name(service: &ServiceDescriptor) -> &str {
    service.sec_com_headers.state_request_name.as_deref().unwrap_or(DEFAULT_STATE_HEADER)
}

/// Header carrying the claim token for this service.
pub fn claim_header_name(service: &ServiceDescriptor) -> &str {
    service.sec_com_headers.claim_request_name.as_deref().unwrap_or(DEFAULT_CLAIM_HEADER)
}

/// Response header expected to carry the state echo.
pub fn state_response_header_name(service: &ServiceDescriptor) -> &str {
    service.sec_com_headers.state_response_name.as_deref().unwrap_or(DEFAULT_STATE_RESP_HEADER)
}

/// Sign the state and claim tokens for one attempt at epoch-second `now`.
pub fn issue_tokens(
    service: &ServiceDescriptor,
    caller: &CallerIdentity<'_>,
    now: i64,
) -> GatewayResult<SecComExchange> {
    let state = Uuid::new_v4().to_string();
    let alg = algorithm_for(&service.sec_com_settings)?;
    let key = encoding_key_for(&service.sec_com_settings)?;
    let header = Header::new(alg);
    let exp = now + service.sec_com_ttl as i64;

    let state_token = if service.send_state_challenge {
        let claims = json!({
            "jti": Uuid::new_v4().to_string(),
            "iat": now,
            "exp": exp,
            "state": state,
        });
        Some(jsonwebtoken::encode(&header, &claims, &key).map_err(|e| {
            GatewayError::Internal { message: format!("state token signing failed: {e}") }
        })?)
    } else {
        None
    };

    let claim_token = if service.send_info_token {
        let claims = claim_token_body(service, caller, now, exp);
        Some(jsonwebtoken::encode(&header, &claims, &key).map_err(|e| {
            GatewayError::Internal { message: format!("claim token signing failed: {e}") }
        })?)
    } else {
        None
    };

    Ok(SecComExchange { state, state_token, claim_token, phase: ExchangePhase::TokensIssued })
}

fn claim_token_body(
    service: &ServiceDescriptor,
    caller: &CallerIdentity<'_>,
    now: i64,
    exp: i64,
) -> serde_json::Value {
    let jti = Uuid::new_v4().to_string();
    let aud = service.exposed_domain();
    let sub = caller
        .apikey
        .map(|k| k.client_id.clone())
        .or_else(|| caller.user.map(|u| u.email.clone()))
        .unwrap_or_else(|| "anonymous".to_string());

    match service.sec_com_info_token_version {
        SecComInfoTokenVersion::Legacy => {
            let (email, name) = match (caller.user, caller.apikey) {
                (Some(user), _) => (user.email.clone(), user.name.clone()),
                (None, Some(key)) => (key.client_id.clone(), key.client_name.clone()),
                (None, None) => (String::new(), "anonymous".to_string()),
            };
            json!({
                "email": email,
                "name": name,
                "app_metadata": caller.apikey.map(|k| k.metadata.clone()),
                "user_metadata": caller.user.map(|u| u.profile.clone()),
                "iss": TOKEN_ISSUER,
                "sub": sub,
                "aud": aud,
                "exp": exp,
                "iat": now,
                "jti": jti,
            })
        }
        SecComInfoTokenVersion::Latest => {
            let access_type = match (caller.apikey, caller.user) {
                (Some(_), _) => "apikey",
                (None, Some(_)) => "user",
                (None, None) => "public",
            };
            json!({
                "access_type": access_type,
                "apikey": caller.apikey.map(|k| json!({
                    "clientId": k.client_id,
                    "clientName": k.client_name,
                    "metadata": k.metadata,
                    "tags": k.tags,
                })),
                "user": caller.user.map(|u| json!({
                    "name": u.name,
                    "email": u.email,
                    "profile": u.profile,
                })),
                "iss": TOKEN_ISSUER,
                "sub": sub,
                "aud": aud,
                "exp": exp,
                "iat": now,
                "jti": jti,
            })
        }
    }
}

/// Validate the upstream's state echo for one attempt.
///
/// V1 never validates. V2 requires a token signed with the service settings
/// whose `state-resp` equals the state we sent, whose expiry has not passed
/// at `now`, whose declared lifetime fits in `secComTtl`, and whose state has
/// not been accepted before within the TTL window.
pub fn validate_state_response(
    service: &ServiceDescriptor,
    exchange: &mut SecComExchange,
    header_value: Option<&str>,
    replay: &ReplayCache,
    now: i64,
) -> GatewayResult<()> {
    if service.sec_com_version == SecComVersion::V1 {
        exchange.advance(ExchangePhase::Verified);
        return Ok(());
    }
    exchange.advance(ExchangePhase::Awaiting);

    let token = header_value.ok_or_else(|| {
        exchange_rejected(exchange, "missing state response header".to_string())
    })?;

    let alg = algorithm_for(&service.sec_com_settings)?;
    let key = decoding_key_for(&service.sec_com_settings)?;
    let mut validation = Validation::new(alg);
    validation.validate_aud = false;
    // expiry is checked manually against `now` so attempts are reproducible
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let data = jsonwebtoken::decode::<serde_json::Value>(token, &key, &validation)
        .map_err(|e| exchange_rejected(exchange, format!("bad state response token: {e}")))?;
    let claims = data.claims;

    let echoed = claims.get("state-resp").and_then(|v| v.as_str()).unwrap_or_default();
    if echoed != exchange.state {
        return Err(exchange_rejected(exchange, "state mismatch".to_string()));
    }

    let iat = claims.get("iat").and_then(|v| v.as_i64()).unwrap_or(0);
    let exp = claims.get("exp").and_then(|v| v.as_i64()).unwrap_or(0);
    if exp <= now {
        return Err(exchange_rejected(exchange, "state response token expired".to_string()));
    }
    if exp - iat > service.sec_com_ttl as i64 {
        return Err(exchange_rejected(
            exchange,
            "state response lifetime exceeds the configured ttl".to_string(),
        ));
    }

    if !replay.register(&exchange.state, service.sec_com_ttl, now * 1_000) {
        return Err(exchange_rejected(exchange, "state response replayed".to_string()));
    }

    exchange.advance(ExchangePhase::Verified);
    Ok(())
}

fn exchange_rejected(exchange: &mut SecComExchange, message: String) -> GatewayError {
    exchange.advance(ExchangePhase::Rejected);
    GatewayError::UpstreamTokenInvalid { message }
}

/// Sweep cadence of the replay cache, in registrations.
const REPLAY_SWEEP_EVERY: u64 = 256;

/// Bounded TTL map of accepted state values. Entries leave by expiry, never
/// by size pressure.
pub struct ReplayCache {
    seen: DashMap<String, i64>,
    registrations: AtomicU64,
}

impl ReplayCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self { seen: DashMap::new(), registrations: AtomicU64::new(0) }
    }

    /// Register an accepted state. Returns `false` when the state was already
    /// accepted and its TTL window has not closed.
    pub fn register(&self, state: &str, ttl_secs: u64, now_ms: i64) -> bool {
        let expires_at = now_ms + (ttl_secs as i64) * 1_000;
        let fresh = match self.seen.entry(state.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() > now_ms {
                    false
                } else {
                    entry.insert(expires_at);
                    true
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(expires_at);
                true
            }
        };
        if self.registrations.fetch_add(1, Ordering::Relaxed) % REPLAY_SWEEP_EVERY == 0 {
            self.seen.retain(|_, exp| *exp > now_ms);
        }
        fresh
    }

    /// Number of tracked states (including not-yet-swept expired ones).
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}
