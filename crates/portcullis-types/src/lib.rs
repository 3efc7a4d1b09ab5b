//! # Portcullis Types
//!
//! Shared data model for the Portcullis gateway.
//!
//! This crate provides the foundational type system for the Portcullis ecosystem:
//!
//! - **`error`** - The gateway error taxonomy (stable identifiers + HTTP status mapping)
//! - **`models`** - Config entities (services, API keys, groups, verifiers) and runtime views
//!
//! `portcullis-types` sits at the bottom of the dependency graph; both
//! `portcullis-core` and `portcullis-server` depend on it. All config entities
//! are serde-serializable with the persisted JSON field names of the datastore
//! contract (camelCase), `Clone` for cheap sharing across async boundaries and
//! `PartialEq` for testing.

pub mod error;
pub mod models;

pub use error::{GatewayError, GatewayResult, QuotaDimension};
pub use models::{
    AlgoSettings, ApiKey, ApiKeyConstraints, ApiKeyRouteMatcher, AuthModuleConfig,
    BasicAuthConstraints, Certificate, ClientConfig, CustomHeadersAuthConstraints, GlobalConfig,
    IpFiltering, JwtAuthConstraints, JwtTokenLocation, JwtVerifier, LoadBalancing,
    PrivateAppsUser, RestrictionPath, Restrictions, SecComHeaders, SecComInfoTokenVersion,
    SecComVersion, ServiceDescriptor, ServiceGroup, ServiceJwtVerifier, StatsView, Target,
    TargetPredicate, TargetScheme, VerificationSettings,
};
