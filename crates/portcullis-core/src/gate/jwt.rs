//! Inbound JWT verification.
//!
//! When a service configures a verifier, the token is located in the
//! configured source, its signature is checked against the verifier's
//! algorithm settings, then the claim checks run: equality fields must match
//! exactly, array fields must be arrays containing the required value. In
//! strict mode a missing token is a failure; otherwise the stage is skipped.

use crate::gate::AccessRequest;
use crate::seccom::{algorithm_for, decoding_key_for};
use jsonwebtoken::Validation;
use portcullis_types::error::{GatewayError, GatewayResult};
use portcullis_types::models::{JwtTokenLocation, JwtVerifier};

fn locate_token(verifier: &JwtVerifier, req: &AccessRequest<'_>) -> Option<String> {
    match &verifier.source {
        JwtTokenLocation::InHeader { name } => {
            req.headers.get(&name.to_ascii_lowercase()).map(|raw| {
                raw.strip_prefix("Bearer ").unwrap_or(raw.as_str()).to_string()
            })
        }
        JwtTokenLocation::InQueryParam { name } => req.query.get(name).cloned(),
        JwtTokenLocation::InCookie { name } => req.cookies.get(name).cloned(),
    }
}

/// Result of the verifier stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwtOutcome {
    /// Verifier disabled or no token offered in lax mode
    Skipped,
    /// A token was located and fully verified; counts as authentication
    Verified,
}

/// Run the verifier against one request.
pub fn check(verifier: &JwtVerifier, req: &AccessRequest<'_>) -> GatewayResult<JwtOutcome> {
    if !verifier.enabled {
        return Ok(JwtOutcome::Skipped);
    }

    let Some(token) = locate_token(verifier, req) else {
        if verifier.strict {
            return Err(GatewayError::BadToken { message: "token not found".to_string() });
        }
        return Ok(JwtOutcome::Skipped);
    };

    let alg = algorithm_for(&verifier.algo_settings)?;
    let key = decoding_key_for(&verifier.algo_settings)?;
    let mut validation = Validation::new(alg);
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let decoded = jsonwebtoken::decode::<serde_json::Value>(&token, &key, &validation)
        .map_err(|e| GatewayError::BadToken { message: e.to_string() })?;
    let claims = decoded.claims;

    for (field, expected) in &verifier.verification_settings.fields {
        let actual = claims.get(field);
        let matches = match actual {
            Some(serde_json::Value::String(s)) => s == expected,
            Some(other) => other.to_string() == *expected,
            None => false,
        };
        if !matches {
            return Err(GatewayError::BadToken {
                message: format!("claim {field} does not match"),
            });
        }
    }

    for (field, required) in &verifier.verification_settings.array_fields {
        let holds = claims
            .get(field)
            .and_then(|v| v.as_array())
            .is_some_and(|arr| arr.iter().any(|v| v.as_str() == Some(required.as_str())));
        if !holds {
            return Err(GatewayError::BadToken {
                message: format!("claim {field} does not contain the required value"),
            });
        }
    }

    Ok(JwtOutcome::Verified)
}
