//! Service resolution by host and path.
//!
//! A descriptor matches when the (case-insensitive, port-stripped) host equals
//! `subdomain.env.domain`, or `subdomain.domain` when the service runs on the
//! default line, or the service's exposed-domain override; and the path starts
//! with the service root. `*` as a subdomain matches any single label.
//!
//! When several descriptors match, preference is: longest root, then fewest
//! wildcards, then lexicographically smallest id. For a fixed snapshot the
//! result is a pure function of `(host, path)`.

use crate::store::{CompiledService, ConfigSnapshot};
use portcullis_types::error::{GatewayError, GatewayResult};
use std::sync::Arc;

/// A resolved route.
#[derive(Debug)]
pub struct RouteMatch {
    /// The matched service with compiled patterns
    pub service: Arc<CompiledService>,
    /// Original path minus the service root (always starts with `/`)
    pub remaining_path: String,
    /// Whether the path falls in the service's public partition
    pub is_public: bool,
}

/// Strip the port and lowercase the host.
pub fn normalize_host(host: &str) -> String {
    // IPv6 literals keep their brackets; everything after the closing bracket
    // or the first colon is the port.
    let stripped = if let Some(end) = host.strip_prefix('[').and_then(|_| host.find(']')) {
        &host[..=end]
    } else {
        host.split(':').next().unwrap_or(host)
    };
    stripped.to_ascii_lowercase()
}

fn host_matches(service: &portcullis_types::ServiceDescriptor, host: &str, default_line: &str) -> bool {
    if let Some(ref over) = service.exposed_domain_override {
        if over.to_ascii_lowercase() == host {
            return true;
        }
    }
    let domain = service.domain.to_ascii_lowercase();
    let env = service.env.to_ascii_lowercase();
    let on_default_line = env == default_line.to_ascii_lowercase();

    let tail_with_env = format!("{env}.{domain}");
    let label = if service.subdomain == "*" { None } else { Some(service.subdomain.to_ascii_lowercase()) };

    let check = |tail: &str| -> bool {
        match &label {
            Some(sub) => host == format!("{sub}.{tail}"),
            None => host
                .strip_suffix(&format!(".{tail}"))
                .is_some_and(|prefix| !prefix.is_empty() && !prefix.contains('.')),
        }
    };

    check(&tail_with_env) || (on_default_line && check(&domain))
}

fn path_matches(root: &str, path: &str) -> bool {
    root == "/" || path.starts_with(root)
}

fn remaining_path(root: &str, path: &str) -> String {
    if root == "/" {
        return path.to_string();
    }
    let rest = path.strip_prefix(root).unwrap_or(path);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    }
}

/// All descriptors matching `(host, path)`, in preference order.
pub fn route_all(
    snapshot: &ConfigSnapshot,
    host: &str,
    path: &str,
) -> Vec<Arc<CompiledService>> {
    let host = normalize_host(host);
    let default_line = snapshot.global.default_line();

    let mut matches: Vec<Arc<CompiledService>> = snapshot
        .services
        .iter()
        .filter(|svc| {
            host_matches(&svc.descriptor, &host, default_line)
                && path_matches(&svc.descriptor.root, path)
        })
        .cloned()
        .collect();

    matches.sort_by(|a, b| {
        b.descriptor
            .root
            .len()
            .cmp(&a.descriptor.root.len())
            .then_with(|| a.descriptor.wildcard_count().cmp(&b.descriptor.wildcard_count()))
            .then_with(|| a.descriptor.id.cmp(&b.descriptor.id))
    });
    matches
}

/// Resolve `(host, path)` to the single preferred service.
pub fn route(snapshot: &ConfigSnapshot, host: &str, path: &str) -> GatewayResult<RouteMatch> {
    let candidates = route_all(snapshot, host, path);
    match candidates.into_iter().next() {
        Some(service) => Ok(to_match(service, path)),
        None => Err(GatewayError::ServiceNotFound { host: normalize_host(host) }),
    }
}

/// Build a [`RouteMatch`] for an already chosen candidate.
pub fn to_match(service: Arc<CompiledService>, path: &str) -> RouteMatch {
    let remaining = remaining_path(&service.descriptor.root, path);
    let is_public = service.is_public_path(path);
    RouteMatch { service, remaining_path: remaining, is_public }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Datastore;
    use portcullis_types::ServiceDescriptor;

    async fn snapshot_with(services: Vec<ServiceDescriptor>) -> Arc<ConfigSnapshot> {
        let store = Datastore::new();
        for svc in services {
            store.upsert_service(svc).await;
        }
        store.view().current()
    }

    fn svc(id: &str, sub: &str, domain: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            id: id.into(),
            name: id.into(),
            subdomain: sub.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolves_with_and_without_env_label() {
        let snap = snapshot_with(vec![svc("s1", "api", "oto.tools")]).await;
        assert!(route(&snap, "api.oto.tools", "/users").is_ok());
        assert!(route(&snap, "api.prod.oto.tools", "/users").is_ok());
        assert!(route(&snap, "api.dev.oto.tools", "/users").is_err());
    }

    #[tokio::test]
    async fn env_label_is_mandatory_off_the_default_line() {
        let mut staging = svc("s1", "api", "oto.tools");
        staging.env = "staging".into();
        let snap = snapshot_with(vec![staging]).await;
        assert!(route(&snap, "api.staging.oto.tools", "/x").is_ok());
        assert!(route(&snap, "api.oto.tools", "/x").is_err());
    }

    #[tokio::test]
    async fn host_matching_is_case_insensitive_and_ignores_port() {
        let snap = snapshot_with(vec![svc("s1", "api", "oto.tools")]).await;
        assert!(route(&snap, "API.Oto.Tools:8443", "/x").is_ok());
    }

    #[tokio::test]
    async fn wildcard_subdomain_matches_any_single_label() {
        let snap = snapshot_with(vec![svc("s1", "*", "oto.tools")]).await;
        assert!(route(&snap, "anything.oto.tools", "/x").is_ok());
        assert!(route(&snap, "a.b.oto.tools", "/x").is_err());
        assert!(route(&snap, "oto.tools", "/x").is_err());
    }

    #[tokio::test]
    async fn exposed_domain_override_wins() {
        let mut s = svc("s1", "api", "oto.tools");
        s.exposed_domain_override = Some("edge.example.com".into());
        let snap = snapshot_with(vec![s]).await;
        assert!(route(&snap, "edge.example.com", "/x").is_ok());
        // derived domain still resolves
        assert!(route(&snap, "api.oto.tools", "/x").is_ok());
    }

    #[tokio::test]
    async fn longest_root_wins_then_specificity_then_id() {
        let mut a = svc("b-svc", "api", "oto.tools");
        a.root = "/v2".into();
        let b = svc("a-svc", "api", "oto.tools");
        let mut wild = svc("0-wild", "*", "oto.tools");
        wild.root = "/".into();

        let snap = snapshot_with(vec![a, b, wild]).await;

        // longest root first
        let got = route(&snap, "api.oto.tools", "/v2/users").unwrap();
        assert_eq!(got.service.descriptor.id, "b-svc");
        assert_eq!(got.remaining_path, "/users");

        // same root: exact subdomain beats wildcard, then id order
        let got = route(&snap, "api.oto.tools", "/other").unwrap();
        assert_eq!(got.service.descriptor.id, "a-svc");
    }

    #[tokio::test]
    async fn routing_is_deterministic_for_a_fixed_snapshot() {
        let snap =
            snapshot_with(vec![svc("s1", "api", "oto.tools"), svc("s2", "api", "oto.tools")])
                .await;
        let first = route(&snap, "api.oto.tools", "/x").unwrap().service.descriptor.id.clone();
        for _ in 0..50 {
            let again = route(&snap, "api.oto.tools", "/x").unwrap();
            assert_eq!(again.service.descriptor.id, first);
        }
    }

    #[tokio::test]
    async fn unmatched_host_is_service_not_found() {
        let snap = snapshot_with(vec![svc("s1", "api", "oto.tools")]).await;
        let err = route(&snap, "nope.oto.tools", "/x").unwrap_err();
        assert_eq!(err.kind(), "errors.service.not.found");
    }

    #[tokio::test]
    async fn public_partition_follows_patterns() {
        let mut s = svc("s1", "api", "oto.tools");
        s.public_patterns = vec!["/public/.*".into()];
        s.private_patterns = vec!["/public/secret/.*".into()];
        let snap = snapshot_with(vec![s]).await;

        assert!(route(&snap, "api.oto.tools", "/public/docs").unwrap().is_public);
        assert!(!route(&snap, "api.oto.tools", "/public/secret/keys").unwrap().is_public);
        assert!(!route(&snap, "api.oto.tools", "/private").unwrap().is_public);
    }
}
