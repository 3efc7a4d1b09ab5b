//! Private-app session store.
//!
//! Sessions are minted by the (external) auth modules and consumed by the
//! access gate via the `oto-papps-*` cookie. The store owns them: lookups
//! drop expired entries, logout destroys them explicitly.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use portcullis_types::models::PrivateAppsUser;
use uuid::Uuid;

/// TTL map of live private-app sessions, keyed by the session's random id.
pub struct SessionStore {
    sessions: DashMap<String, PrivateAppsUser>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self { sessions: DashMap::new() }
    }

    /// Mint and register a session valid for `max_age_secs`.
    pub fn create(
        &self,
        name: &str,
        email: &str,
        realm: &str,
        profile: serde_json::Value,
        max_age_secs: u64,
    ) -> PrivateAppsUser {
        let now = Utc::now();
        let user = PrivateAppsUser {
            random_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            email: email.to_string(),
            profile,
            realm: realm.to_string(),
            created_at: now,
            expired_at: now + Duration::seconds(max_age_secs as i64),
        };
        self.sessions.insert(user.random_id.clone(), user.clone());
        user
    }

    /// Register an externally minted session (e.g. seeded by a login callback).
    pub fn register(&self, user: PrivateAppsUser) {
        self.sessions.insert(user.random_id.clone(), user);
    }

    /// Look up a live session; expired entries are destroyed on access.
    pub fn get(&self, session_id: &str) -> Option<PrivateAppsUser> {
        let user = self.sessions.get(session_id).map(|u| u.clone())?;
        if user.is_valid_at(Utc::now()) {
            Some(user)
        } else {
            self.sessions.remove(session_id);
            None
        }
    }

    /// Destroy a session (logout).
    pub fn destroy(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Drop every expired session. Called periodically by the server loop.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.sessions.retain(|_, user| user.is_valid_at(now));
    }

    /// Number of live entries (including not-yet-swept expired ones).
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no session.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
