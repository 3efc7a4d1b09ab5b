//! Datastore and config views.
//!
//! Config entities have a single writer (the [`Datastore`]) and many readers.
//! Readers never touch the store on the hot path: every mutation rebuilds an
//! immutable [`ConfigSnapshot`] (with precompiled pattern sets) and publishes
//! it on a watch channel; request handlers grab the current `Arc` and work
//! against a consistent view for the whole request.

pub mod quotas;

use portcullis_types::models::{
    ApiKey, AuthModuleConfig, Certificate, GlobalConfig, JwtVerifier, RestrictionPath,
    ServiceDescriptor, ServiceGroup,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// A service descriptor with its pattern sets compiled once per snapshot.
#[derive(Debug)]
pub struct CompiledService {
    /// The raw descriptor
    pub descriptor: Arc<ServiceDescriptor>,
    /// Compiled `publicPatterns`
    pub public_patterns: Vec<Regex>,
    /// Compiled `privatePatterns`
    pub private_patterns: Vec<Regex>,
    /// Compiled restriction entries: (method, anchored path regex)
    pub allowed: Vec<(String, Regex)>,
    /// Compiled forbidden entries
    pub forbidden: Vec<(String, Regex)>,
    /// Compiled not-found entries
    pub not_found: Vec<(String, Regex)>,
}

/// Anchor a configured pattern so it must match the whole path.
fn compile_anchored(pattern: &str, service_id: &str) -> Option<Regex> {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!("service {}: dropping invalid pattern {:?}: {}", service_id, pattern, e);
            None
        }
    }
}

fn compile_restrictions(entries: &[RestrictionPath], service_id: &str) -> Vec<(String, Regex)> {
    entries
        .iter()
        .filter_map(|r| {
            compile_anchored(&r.path, service_id).map(|re| (r.method.to_uppercase(), re))
        })
        .collect()
}

impl CompiledService {
    fn compile(descriptor: ServiceDescriptor) -> Self {
        let id = descriptor.id.clone();
        let public_patterns = descriptor
            .public_patterns
            .iter()
            .filter_map(|p| compile_anchored(p, &id))
            .collect();
        let private_patterns = descriptor
            .private_patterns
            .iter()
            .filter_map(|p| compile_anchored(p, &id))
            .collect();
        let allowed = compile_restrictions(&descriptor.restrictions.allowed, &id);
        let forbidden = compile_restrictions(&descriptor.restrictions.forbidden, &id);
        let not_found = compile_restrictions(&descriptor.restrictions.not_found, &id);
        Self {
            descriptor: Arc::new(descriptor),
            public_patterns,
            private_patterns,
            allowed,
            forbidden,
            not_found,
        }
    }

    /// Public iff some public pattern matches and no private pattern does.
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_patterns.iter().any(|re| re.is_match(path))
            && !self.private_patterns.iter().any(|re| re.is_match(path))
    }
}

/// An immutable, internally consistent view of all config entities.
pub struct ConfigSnapshot {
    /// Compiled services, unordered (the router applies its own preference)
    pub services: Vec<Arc<CompiledService>>,
    /// API keys by client id
    pub apikeys: HashMap<String, ApiKey>,
    /// Groups by id
    pub groups: HashMap<String, ServiceGroup>,
    /// Named JWT verifiers by id
    pub verifiers: HashMap<String, JwtVerifier>,
    /// Auth module configs by id
    pub auth_modules: HashMap<String, AuthModuleConfig>,
    /// Certificates by id
    pub certificates: HashMap<String, Certificate>,
    /// Site-wide defaults
    pub global: GlobalConfig,
    /// Monotonic snapshot version
    pub version: u64,
}

impl ConfigSnapshot {
    fn empty() -> Self {
        Self {
            services: Vec::new(),
            apikeys: HashMap::new(),
            groups: HashMap::new(),
            verifiers: HashMap::new(),
            auth_modules: HashMap::new(),
            certificates: HashMap::new(),
            global: GlobalConfig::default(),
            version: 0,
        }
    }
}

/// Read handle over the latest [`ConfigSnapshot`].
#[derive(Clone)]
pub struct ConfigView {
    rx: watch::Receiver<Arc<ConfigSnapshot>>,
}

impl ConfigView {
    /// The current snapshot. Cheap; clones an `Arc`.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.rx.borrow().clone()
    }

    /// Completes when a newer snapshot has been published.
    pub async fn changed(&mut self) {
        let _ = self.rx.changed().await;
    }
}

/// JSON export format consumed by the explicit startup import.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigExport {
    /// Site-wide defaults
    #[serde(default)]
    pub global_config: GlobalConfig,
    /// Service descriptors
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
    /// API keys
    #[serde(default)]
    pub apikeys: Vec<ApiKey>,
    /// Service groups
    #[serde(default)]
    pub groups: Vec<ServiceGroup>,
    /// Named JWT verifiers, keyed by id
    #[serde(default)]
    pub jwt_verifiers: HashMap<String, JwtVerifier>,
    /// Auth modules
    #[serde(default)]
    pub auth_modules: Vec<AuthModuleConfig>,
    /// Certificates
    #[serde(default)]
    pub certificates: Vec<Certificate>,
}

/// The single writer for config entities.
///
/// All mutation paths end in [`Datastore::rebuild`], which compiles and
/// publishes a fresh snapshot. Readers hold a [`ConfigView`] and never block
/// writers.
pub struct Datastore {
    services: RwLock<HashMap<String, ServiceDescriptor>>,
    apikeys: RwLock<HashMap<String, ApiKey>>,
    groups: RwLock<HashMap<String, ServiceGroup>>,
    verifiers: RwLock<HashMap<String, JwtVerifier>>,
    auth_modules: RwLock<HashMap<String, AuthModuleConfig>>,
    certificates: RwLock<HashMap<String, Certificate>>,
    global: RwLock<GlobalConfig>,
    version: AtomicU64,
    tx: watch::Sender<Arc<ConfigSnapshot>>,
}

impl Datastore {
    /// Create an empty datastore.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ConfigSnapshot::empty()));
        Self {
            services: RwLock::new(HashMap::new()),
            apikeys: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            verifiers: RwLock::new(HashMap::new()),
            auth_modules: RwLock::new(HashMap::new()),
            certificates: RwLock::new(HashMap::new()),
            global: RwLock::new(GlobalConfig::default()),
            version: AtomicU64::new(0),
            tx,
        }
    }

    /// A new read handle. Handles see every snapshot published after creation.
    pub fn view(&self) -> ConfigView {
        ConfigView { rx: self.tx.subscribe() }
    }

    /// Create or replace a service descriptor.
    pub async fn upsert_service(&self, svc: ServiceDescriptor) {
        self.services.write().await.insert(svc.id.clone(), svc);
        self.rebuild().await;
    }

    /// Remove a service descriptor.
    pub async fn delete_service(&self, id: &str) {
        self.services.write().await.remove(id);
        self.rebuild().await;
    }

    /// Create or replace an API key.
    pub async fn upsert_apikey(&self, key: ApiKey) {
        self.apikeys.write().await.insert(key.client_id.clone(), key);
        self.rebuild().await;
    }

    /// Remove an API key.
    pub async fn delete_apikey(&self, client_id: &str) {
        self.apikeys.write().await.remove(client_id);
        self.rebuild().await;
    }

    /// Create or replace a group.
    pub async fn upsert_group(&self, group: ServiceGroup) {
        self.groups.write().await.insert(group.id.clone(), group);
        self.rebuild().await;
    }

    /// Create or replace a named JWT verifier.
    pub async fn upsert_verifier(&self, id: String, verifier: JwtVerifier) {
        self.verifiers.write().await.insert(id, verifier);
        self.rebuild().await;
    }

    /// Create or replace an auth module.
    pub async fn upsert_auth_module(&self, module: AuthModuleConfig) {
        self.auth_modules.write().await.insert(module.id().to_string(), module);
        self.rebuild().await;
    }

    /// Create or replace a certificate.
    pub async fn upsert_certificate(&self, cert: Certificate) {
        self.certificates.write().await.insert(cert.id.clone(), cert);
        self.rebuild().await;
    }

    /// Replace the site-wide config.
    pub async fn set_global_config(&self, global: GlobalConfig) {
        *self.global.write().await = global;
        self.rebuild().await;
    }

    /// Seed the store from an export. Explicit only: callers decide when this
    /// runs (boot, CLI); it is never triggered by change notifications.
    pub async fn import(&self, export: ConfigExport) {
        let n_services = export.services.len();
        let n_keys = export.apikeys.len();
        {
            let mut services = self.services.write().await;
            for svc in export.services {
                if services.insert(svc.id.clone(), svc).is_some() {
                    tracing::warn!("import overwrites an existing service descriptor");
                }
            }
        }
        {
            let mut apikeys = self.apikeys.write().await;
            for key in export.apikeys {
                apikeys.insert(key.client_id.clone(), key);
            }
        }
        {
            let mut groups = self.groups.write().await;
            for group in export.groups {
                groups.insert(group.id.clone(), group);
            }
        }
        {
            let mut verifiers = self.verifiers.write().await;
            for (id, v) in export.jwt_verifiers {
                verifiers.insert(id, v);
            }
        }
        {
            let mut modules = self.auth_modules.write().await;
            for m in export.auth_modules {
                modules.insert(m.id().to_string(), m);
            }
        }
        {
            let mut certs = self.certificates.write().await;
            for c in export.certificates {
                certs.insert(c.id.clone(), c);
            }
        }
        *self.global.write().await = export.global_config;
        self.rebuild().await;
        tracing::info!("imported {} services and {} api keys", n_services, n_keys);
    }

    /// Compile and publish a fresh snapshot from the current maps.
    async fn rebuild(&self) {
        let services = self.services.read().await.clone();
        let apikeys = self.apikeys.read().await.clone();
        let groups = self.groups.read().await.clone();
        let verifiers = self.verifiers.read().await.clone();
        let auth_modules = self.auth_modules.read().await.clone();
        let certificates = self.certificates.read().await.clone();
        let global = self.global.read().await.clone();
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;

        let compiled =
            services.into_values().map(|svc| Arc::new(CompiledService::compile(svc))).collect();

        let snapshot = Arc::new(ConfigSnapshot {
            services: compiled,
            apikeys,
            groups,
            verifiers,
            auth_modules,
            certificates,
            global,
            version,
        });
        // send_replace never fails even with zero receivers
        self.tx.send_replace(snapshot);
        tracing::debug!("published config snapshot v{}", version);
    }
}

impl Default for Datastore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_updates_on_mutation() {
        let store = Datastore::new();
        let view = store.view();
        assert_eq!(view.current().version, 0);

        store
            .upsert_service(ServiceDescriptor {
                id: "svc-1".into(),
                subdomain: "api".into(),
                domain: "oto.tools".into(),
                ..Default::default()
            })
            .await;

        let snap = view.current();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.services.len(), 1);

        store.delete_service("svc-1").await;
        assert!(view.current().services.is_empty());
    }

    #[tokio::test]
    async fn invalid_patterns_are_dropped_not_fatal() {
        let store = Datastore::new();
        store
            .upsert_service(ServiceDescriptor {
                id: "svc-1".into(),
                subdomain: "api".into(),
                domain: "oto.tools".into(),
                public_patterns: vec!["/public/.*".into(), "([".into()],
                ..Default::default()
            })
            .await;
        let snap = store.view().current();
        assert_eq!(snap.services[0].public_patterns.len(), 1);
        assert!(snap.services[0].is_public_path("/public/docs"));
    }

    #[tokio::test]
    async fn private_patterns_override_public_ones() {
        let store = Datastore::new();
        store
            .upsert_service(ServiceDescriptor {
                id: "svc-1".into(),
                subdomain: "api".into(),
                domain: "oto.tools".into(),
                public_patterns: vec!["/.*".into()],
                private_patterns: vec!["/admin/.*".into()],
                ..Default::default()
            })
            .await;
        let snap = store.view().current();
        assert!(snap.services[0].is_public_path("/docs"));
        assert!(!snap.services[0].is_public_path("/admin/users"));
    }

    #[tokio::test]
    async fn import_seeds_everything_at_once() {
        let store = Datastore::new();
        let export = ConfigExport {
            services: vec![ServiceDescriptor { id: "s1".into(), ..Default::default() }],
            apikeys: vec![ApiKey { client_id: "ck1".into(), ..Default::default() }],
            groups: vec![ServiceGroup { id: "g1".into(), name: "g".into(), ..Default::default() }],
            ..Default::default()
        };
        store.import(export).await;
        let snap = store.view().current();
        assert_eq!(snap.services.len(), 1);
        assert!(snap.apikeys.contains_key("ck1"));
        assert!(snap.groups.contains_key("g1"));
    }
}
