//! JWT verifier configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Verifies an inbound JWT before API-key processing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JwtVerifier {
    /// Disabled verifiers are skipped entirely
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// In strict mode a missing token is a failure
    #[serde(default)]
    pub strict: bool,
    /// Where the token is read from
    #[serde(default)]
    pub source: JwtTokenLocation,
    /// Signature settings
    #[serde(default)]
    pub algo_settings: AlgoSettings,
    /// Claim checks applied after signature verification
    #[serde(default)]
    pub verification_settings: VerificationSettings,
}

fn default_true() -> bool {
    true
}

impl Default for JwtVerifier {
    fn default() -> Self {
        Self {
            enabled: true,
            strict: false,
            source: JwtTokenLocation::default(),
            algo_settings: AlgoSettings::default(),
            verification_settings: VerificationSettings::default(),
        }
    }
}

/// Where a JWT is carried on the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JwtTokenLocation {
    /// Read from a header; a `Bearer ` prefix is tolerated
    InHeader {
        /// Header name
        name: String,
    },
    /// Read from a query parameter
    InQueryParam {
        /// Parameter name
        name: String,
    },
    /// Read from a cookie
    InCookie {
        /// Cookie name
        name: String,
    },
}

impl Default for JwtTokenLocation {
    fn default() -> Self {
        JwtTokenLocation::InHeader { name: "Authorization".to_string() }
    }
}

/// Signature algorithm + key material, shared with the signing side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AlgoSettings {
    /// HMAC-SHA shared secret
    Hmac {
        /// 256, 384 or 512
        size: u16,
        /// Shared secret
        secret: String,
    },
    /// RSA keypair, PEM-encoded
    Rsa {
        /// 256, 384 or 512
        size: u16,
        /// PEM public key (verification)
        public_key: String,
        /// PEM private key (signing); absent on verify-only deployments
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private_key: Option<String>,
    },
    /// ECDSA keypair, PEM-encoded
    Es {
        /// 256 or 384
        size: u16,
        /// PEM public key (verification)
        public_key: String,
        /// PEM private key (signing); absent on verify-only deployments
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private_key: Option<String>,
    },
}

impl Default for AlgoSettings {
    fn default() -> Self {
        AlgoSettings::Hmac { size: 512, secret: "secret".to_string() }
    }
}

/// Claim checks: exact-equality fields and array-containment fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSettings {
    /// Claims that must equal the given string
    #[serde(default)]
    pub fields: HashMap<String, String>,
    /// Claims that must be arrays containing the given string
    #[serde(default)]
    pub array_fields: HashMap<String, String>,
}
