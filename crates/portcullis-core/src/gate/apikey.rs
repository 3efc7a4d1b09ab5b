//! API-key extraction and validation.
//!
//! Keys may be presented three ways, tried in order: a signed bearer token
//! (`Authorization: Otoroshi-Token <jwt>`, signed with the client secret),
//! HTTP basic auth, or a client-id/client-secret header pair. Extraction
//! names are overridable through the service's `apiKeyConstraints`.

use crate::gate::AccessRequest;
use crate::store::ConfigSnapshot;
use base64::engine::general_purpose::{STANDARD as BASE64_STD, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use portcullis_types::error::{GatewayError, GatewayResult};
use portcullis_types::models::{ApiKey, ApiKeyConstraints, ServiceDescriptor};

/// Default header for bearer and basic presentation.
const DEFAULT_AUTH_HEADER: &str = "authorization";
/// Bearer scheme of the signed token.
const BEARER_SCHEME: &str = "Otoroshi-Token ";
/// Default client-id header.
const DEFAULT_CLIENT_ID_HEADER: &str = "otoroshi-client-id";
/// Default client-secret header.
const DEFAULT_CLIENT_SECRET_HEADER: &str = "otoroshi-client-secret";

/// Find the client id a request claims to act as, without verifying anything.
///
/// Used for tag routing across services sharing a host: the candidate list is
/// filtered by routing matchers before the full gate validates the key.
pub fn peek_client_id(snapshot: &ConfigSnapshot, req: &AccessRequest<'_>) -> Option<ApiKey> {
    let constraints = ApiKeyConstraints::default();
    let extracted = extract(&constraints, req)?;
    let key = match &extracted {
        Extracted::SignedToken { token } => {
            let claims = unverified_claims(token)?;
            let client_id = claims
                .get("clientId")
                .and_then(|v| v.as_str())
                .or_else(|| claims.get("iss").and_then(|v| v.as_str()))?;
            snapshot.apikeys.get(client_id)?
        }
        Extracted::Pair { client_id, .. } => snapshot.apikeys.get(client_id.as_str())?,
    };
    Some(key.clone())
}

/// Extract and fully validate the API key for `service`, if one is present.
///
/// `Ok(None)` means no credentials were offered at all; every malformed or
/// rejected credential is an error.
pub fn check(
    snapshot: &ConfigSnapshot,
    service: &ServiceDescriptor,
    req: &AccessRequest<'_>,
) -> GatewayResult<Option<ApiKey>> {
    let Some(extracted) = extract(&service.api_key_constraints, req) else {
        return Ok(None);
    };

    let key = match extracted {
        Extracted::SignedToken { token } => validate_signed_token(snapshot, &token)?,
        Extracted::Pair { client_id, client_secret } => {
            let key = snapshot.apikeys.get(&client_id).ok_or_else(|| {
                GatewayError::ApiKeyInvalid { message: "unknown client id".to_string() }
            })?;
            if key.client_secret != client_secret {
                return Err(GatewayError::ApiKeyInvalid {
                    message: "bad client secret".to_string(),
                });
            }
            key.clone()
        }
    };

    if !key.enabled {
        return Err(GatewayError::ApiKeyInvalid { message: "api key is disabled".to_string() });
    }
    if key.authorized_group != service.group_id {
        return Err(GatewayError::ApiKeyInvalid {
            message: "api key is not authorized on this service group".to_string(),
        });
    }
    Ok(Some(key))
}

enum Extracted {
    SignedToken { token: String },
    Pair { client_id: String, client_secret: String },
}

fn extract(constraints: &ApiKeyConstraints, req: &AccessRequest<'_>) -> Option<Extracted> {
    // 1. signed bearer token
    if constraints.jwt_auth.enabled {
        let header = constraints
            .jwt_auth
            .header_name
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| DEFAULT_AUTH_HEADER.to_string());
        let from_header = req
            .headers
            .get(&header)
            .and_then(|raw| raw.strip_prefix(BEARER_SCHEME))
            .map(str::to_string);
        let token = from_header
            .or_else(|| {
                constraints.jwt_auth.query_name.as_ref().and_then(|q| req.query.get(q).cloned())
            })
            .or_else(|| {
                constraints
                    .jwt_auth
                    .cookie_name
                    .as_ref()
                    .and_then(|c| req.cookies.get(c).cloned())
            });
        if let Some(token) = token {
            return Some(Extracted::SignedToken { token });
        }
    }

    // 2. basic auth
    if constraints.basic_auth.enabled {
        let header = constraints
            .basic_auth
            .header_name
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| DEFAULT_AUTH_HEADER.to_string());
        if let Some(pair) = req
            .headers
            .get(&header)
            .and_then(|raw| raw.strip_prefix("Basic "))
            .and_then(decode_basic_pair)
        {
            return Some(Extracted::Pair { client_id: pair.0, client_secret: pair.1 });
        }
    }

    // 3. header pair
    if constraints.custom_headers_auth.enabled {
        let id_header = constraints
            .custom_headers_auth
            .client_id_header_name
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| DEFAULT_CLIENT_ID_HEADER.to_string());
        let secret_header = constraints
            .custom_headers_auth
            .client_secret_header_name
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| DEFAULT_CLIENT_SECRET_HEADER.to_string());
        if let (Some(client_id), Some(client_secret)) =
            (req.headers.get(&id_header), req.headers.get(&secret_header))
        {
            return Some(Extracted::Pair {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            });
        }
    }

    None
}

fn decode_basic_pair(encoded: &str) -> Option<(String, String)> {
    let decoded = BASE64_STD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (id, secret) = text.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

/// Decode a JWT payload without verifying the signature, to learn which
/// client the caller claims to be.
fn unverified_claims(token: &str) -> Option<serde_json::Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = BASE64_URL.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn validate_signed_token(snapshot: &ConfigSnapshot, token: &str) -> GatewayResult<ApiKey> {
    let claims = unverified_claims(token).ok_or_else(|| GatewayError::ApiKeyInvalid {
        message: "malformed bearer token".to_string(),
    })?;
    let client_id = claims
        .get("clientId")
        .and_then(|v| v.as_str())
        .or_else(|| claims.get("iss").and_then(|v| v.as_str()))
        .ok_or_else(|| GatewayError::ApiKeyInvalid {
            message: "bearer token names no client".to_string(),
        })?;
    let key = snapshot.apikeys.get(client_id).ok_or_else(|| GatewayError::ApiKeyInvalid {
        message: "unknown client id".to_string(),
    })?;

    let header = jsonwebtoken::decode_header(token)
        .map_err(|e| GatewayError::ApiKeyInvalid { message: format!("bad token header: {e}") })?;
    if !matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
        return Err(GatewayError::ApiKeyInvalid {
            message: "bearer tokens must be HMAC-signed with the client secret".to_string(),
        });
    }

    let mut validation = Validation::new(header.alg);
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    jsonwebtoken::decode::<serde_json::Value>(
        token,
        &DecodingKey::from_secret(key.client_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| GatewayError::ApiKeyInvalid { message: format!("bad token signature: {e}") })?;

    Ok(key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Datastore;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn snapshot_with_key(key: ApiKey) -> Arc<ConfigSnapshot> {
        let store = Datastore::new();
        store.upsert_apikey(key).await;
        store.view().current()
    }

    fn service() -> ServiceDescriptor {
        ServiceDescriptor { id: "svc".into(), group_id: "default".into(), ..Default::default() }
    }

    fn req<'a>(headers: &'a HashMap<String, String>) -> AccessRequest<'a> {
        static EMPTY: once_cell::sync::Lazy<HashMap<String, String>> =
            once_cell::sync::Lazy::new(HashMap::new);
        AccessRequest {
            method: "GET",
            path: "/x",
            headers,
            query: &EMPTY,
            cookies: &EMPTY,
            client_ip: "127.0.0.1",
        }
    }

    fn base_key() -> ApiKey {
        ApiKey {
            client_id: "ck-1".into(),
            client_secret: "cs-1".into(),
            client_name: "tester".into(),
            authorized_group: "default".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn custom_headers_pair_is_accepted() {
        let snap = snapshot_with_key(base_key()).await;
        let headers = [
            ("otoroshi-client-id".to_string(), "ck-1".to_string()),
            ("otoroshi-client-secret".to_string(), "cs-1".to_string()),
        ]
        .into_iter()
        .collect();
        let got = check(&snap, &service(), &req(&headers)).unwrap().unwrap();
        assert_eq!(got.client_id, "ck-1");
    }

    #[tokio::test]
    async fn basic_auth_pair_is_accepted_and_bad_secret_rejected() {
        let snap = snapshot_with_key(base_key()).await;

        let encoded = BASE64_STD.encode("ck-1:cs-1");
        let headers =
            [("authorization".to_string(), format!("Basic {encoded}"))].into_iter().collect();
        assert!(check(&snap, &service(), &req(&headers)).unwrap().is_some());

        let encoded = BASE64_STD.encode("ck-1:wrong");
        let headers =
            [("authorization".to_string(), format!("Basic {encoded}"))].into_iter().collect();
        let err = check(&snap, &service(), &req(&headers)).unwrap_err();
        assert_eq!(err.kind(), "errors.apikey.invalid");
    }

    #[tokio::test]
    async fn signed_bearer_token_is_verified_with_the_client_secret() {
        let snap = snapshot_with_key(base_key()).await;
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &json!({ "iss": "ck-1" }),
            &EncodingKey::from_secret(b"cs-1"),
        )
        .unwrap();
        let headers = [("authorization".to_string(), format!("Otoroshi-Token {token}"))]
            .into_iter()
            .collect();
        assert!(check(&snap, &service(), &req(&headers)).unwrap().is_some());

        // wrong signing secret
        let forged = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &json!({ "iss": "ck-1" }),
            &EncodingKey::from_secret(b"not-the-secret"),
        )
        .unwrap();
        let headers = [("authorization".to_string(), format!("Otoroshi-Token {forged}"))]
            .into_iter()
            .collect();
        assert!(check(&snap, &service(), &req(&headers)).is_err());
    }

    #[tokio::test]
    async fn disabled_key_and_wrong_group_are_invalid() {
        let mut disabled = base_key();
        disabled.enabled = false;
        let snap = snapshot_with_key(disabled).await;
        let headers = [
            ("otoroshi-client-id".to_string(), "ck-1".to_string()),
            ("otoroshi-client-secret".to_string(), "cs-1".to_string()),
        ]
        .into_iter()
        .collect();
        assert!(check(&snap, &service(), &req(&headers)).is_err());

        let mut other_group = base_key();
        other_group.authorized_group = "partners".into();
        let snap = snapshot_with_key(other_group).await;
        let err = check(&snap, &service(), &req(&headers)).unwrap_err();
        assert_eq!(err.kind(), "errors.apikey.invalid");
    }

    #[tokio::test]
    async fn absent_credentials_are_not_an_error() {
        let snap = snapshot_with_key(base_key()).await;
        let headers = HashMap::new();
        assert!(check(&snap, &service(), &req(&headers)).unwrap().is_none());
    }

    #[tokio::test]
    async fn peek_resolves_the_claimed_key_without_validating() {
        let snap = snapshot_with_key(base_key()).await;
        let headers = [
            ("otoroshi-client-id".to_string(), "ck-1".to_string()),
            ("otoroshi-client-secret".to_string(), "anything".to_string()),
        ]
        .into_iter()
        .collect();
        let peeked = peek_client_id(&snap, &req(&headers)).unwrap();
        assert_eq!(peeked.client_id, "ck-1");
    }
}
