//! Config entities and runtime views for the Portcullis gateway.
//!
//! Entities are owned by the datastore (single writer, many readers) and are
//! JSON-serialized with camelCase field names, matching the persisted contract.

mod apikey;
mod auth;
mod global;
mod group;
mod jwt;
mod service;
mod stats;

pub use apikey::{
    ApiKey, ApiKeyConstraints, ApiKeyRouteMatcher, BasicAuthConstraints,
    CustomHeadersAuthConstraints, JwtAuthConstraints,
};
pub use auth::{AuthModuleConfig, PrivateAppsUser};
pub use global::{Certificate, GlobalConfig};
pub use group::ServiceGroup;
pub use jwt::{AlgoSettings, JwtTokenLocation, JwtVerifier, VerificationSettings};
pub use service::{
    ClientConfig, IpFiltering, LoadBalancing, RestrictionPath, Restrictions, SecComHeaders,
    SecComInfoTokenVersion, SecComVersion, ServiceDescriptor, ServiceJwtVerifier, Target,
    TargetPredicate, TargetScheme,
};
pub use stats::StatsView;
