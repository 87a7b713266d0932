//! Persistent session store with sliding expiration and a per-user index.
//!
//! Records are keyed by `sha256(token)`; the raw token only travels in the
//! `pulse_session` cookie. Every mutation rewrites `sessions.json` atomically.
//!
//! Lock order: `sessions` before `index`, never the reverse.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock, RwLockWriteGuard},
};
use tracing::{debug, info, warn};

use super::utils::sha256_hex;
use crate::api::handlers::persist::{StoreError, load_json, save_json};

pub const SESSIONS_FILE: &str = "sessions.json";
pub const MAX_SESSIONS_PER_USER: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub token_hash: String,
    #[serde(default)]
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Idle window used for sliding extension.
    pub ttl_seconds: i64,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_access_expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_issuer: Option<String>,
    #[serde(skip)]
    pub refreshing: bool,
}

impl SessionRecord {
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    #[must_use]
    pub fn is_oidc(&self) -> bool {
        self.oidc_issuer.is_some()
    }

    fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_seconds)
    }
}

/// Parameters for a new session.
#[derive(Clone, Debug, Default)]
pub struct NewSession<'a> {
    pub username: &'a str,
    pub ttl: Duration,
    pub user_agent: &'a str,
    pub client_ip: &'a str,
    pub org_id: Option<&'a str>,
}

#[derive(Debug)]
pub struct SessionStore {
    path: Option<PathBuf>,
    max_per_user: usize,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    index: RwLock<HashMap<String, Vec<String>>>,
}

/// Key under which a session token is stored.
#[must_use]
pub fn session_key(token: &str) -> String {
    sha256_hex(token)
}

impl SessionStore {
    /// Load `<data_dir>/sessions.json`, dropping expired records.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join(SESSIONS_FILE);
        let records: Vec<SessionRecord> = match load_json(&path) {
            Ok(records) => records.unwrap_or_default(),
            Err(StoreError::Serde { path, source }) => {
                warn!(path, "Ignoring corrupt session file: {source}");
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        let store = Self::with_path(Some(path));
        store.restore(records, Utc::now());
        Ok(store)
    }

    /// Store that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_path(None)
    }

    fn with_path(path: Option<PathBuf>) -> Self {
        Self {
            path,
            max_per_user: MAX_SESSIONS_PER_USER,
            sessions: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_max_per_user(mut self, max: usize) -> Self {
        self.max_per_user = max.max(1);
        self
    }

    pub(crate) fn restore(&self, mut records: Vec<SessionRecord>, now: DateTime<Utc>) {
        records.retain(|record| record.is_valid_at(now));
        records.sort_by_key(|record| record.created_at);
        let mut sessions = self.write_sessions();
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            if !record.username.is_empty() {
                index
                    .entry(record.username.clone())
                    .or_default()
                    .push(record.token_hash.clone());
            }
            sessions.insert(record.token_hash.clone(), record);
        }
        info!(sessions = sessions.len(), "Loaded sessions");
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionRecord>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, sessions: &HashMap<String, SessionRecord>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut records: Vec<&SessionRecord> = sessions.values().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.token_hash.cmp(&b.token_hash))
        });
        save_json(path, &records)
    }

    /// Create and persist a session.
    ///
    /// # Errors
    /// Returns an error if the session file cannot be written; the in-memory
    /// insert is rolled back.
    pub fn create(&self, token: &str, new: &NewSession<'_>) -> Result<SessionRecord, StoreError> {
        self.create_at(token, new, Utc::now())
    }

    pub(crate) fn create_at(
        &self,
        token: &str,
        new: &NewSession<'_>,
        now: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError> {
        let ttl = if new.ttl > Duration::zero() {
            new.ttl
        } else {
            Duration::seconds(1)
        };
        let record = SessionRecord {
            token_hash: session_key(token),
            username: new.username.to_string(),
            created_at: now,
            expires_at: now + ttl,
            ttl_seconds: ttl.num_seconds().max(1),
            user_agent: new.user_agent.to_string(),
            client_ip: new.client_ip.to_string(),
            org_id: new.org_id.map(ToString::to_string),
            oidc_refresh_token: None,
            oidc_access_expiry: None,
            oidc_issuer: None,
            refreshing: false,
        };

        let mut sessions = self.write_sessions();
        let previous = sessions.insert(record.token_hash.clone(), record.clone());
        if let Err(err) = self.persist(&sessions) {
            match previous {
                Some(previous) => sessions.insert(record.token_hash.clone(), previous),
                None => sessions.remove(&record.token_hash),
            };
            return Err(err);
        }
        Ok(record)
    }

    #[must_use]
    pub fn validate(&self, token: &str) -> bool {
        self.validate_at(token, Utc::now())
    }

    pub(crate) fn validate_at(&self, token: &str, now: DateTime<Utc>) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_key(token))
            .is_some_and(|record| record.is_valid_at(now))
    }

    /// Validate and slide the expiry when less than half the idle window remains.
    ///
    /// Returns a snapshot of the (possibly extended) record.
    pub fn validate_and_extend(&self, token: &str) -> Option<SessionRecord> {
        self.validate_and_extend_at(token, Utc::now())
    }

    pub(crate) fn validate_and_extend_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Option<SessionRecord> {
        let key = session_key(token);
        {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            let record = sessions.get(&key)?;
            if !record.is_valid_at(now) {
                return None;
            }
            if record.expires_at - now >= record.ttl() / 2 {
                return Some(record.clone());
            }
        }

        let mut sessions = self.write_sessions();
        let record = sessions.get_mut(&key)?;
        if !record.is_valid_at(now) {
            return None;
        }
        let extended = now + record.ttl();
        if extended > record.expires_at {
            record.expires_at = extended;
        }
        let snapshot = record.clone();
        if let Err(err) = self.persist(&sessions) {
            warn!("Failed to persist session extension: {err}");
        } else {
            debug!(user = %snapshot.username, expires_at = %snapshot.expires_at, "Session extended");
        }
        Some(snapshot)
    }

    /// Read-only snapshot of a live session.
    #[must_use]
    pub fn get(&self, token: &str) -> Option<SessionRecord> {
        self.get_at(token, Utc::now())
    }

    pub(crate) fn get_at(&self, token: &str, now: DateTime<Utc>) -> Option<SessionRecord> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_key(token))
            .filter(|record| record.is_valid_at(now))
            .cloned()
    }

    /// Username owning a live session.
    #[must_use]
    pub fn username(&self, token: &str) -> Option<String> {
        self.get(token)
            .map(|record| record.username)
            .filter(|name| !name.is_empty())
    }

    /// Delete a session and untrack it.
    ///
    /// Returns the removed record.
    ///
    /// # Errors
    /// Returns an error if the file cannot be rewritten; the record is restored.
    pub fn delete(&self, token: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.delete_key(&session_key(token))
    }

    pub(crate) fn delete_key(&self, key: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut sessions = self.write_sessions();
        let Some(removed) = sessions.remove(key) else {
            return Ok(None);
        };
        if let Err(err) = self.persist(&sessions) {
            sessions.insert(key.to_string(), removed);
            return Err(err);
        }
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(keys) = index.get_mut(&removed.username) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                index.remove(&removed.username);
            }
        }
        Ok(Some(removed))
    }

    /// Record `token` as belonging to `user`, enforcing the per-user cap.
    ///
    /// Stale index entries are purged first; if the user is still over the cap
    /// the oldest live sessions are deleted. Returns the session keys that were
    /// evicted so their CSRF tokens can be dropped.
    ///
    /// # Errors
    /// Returns an error if evictions cannot be persisted.
    pub fn track_user_session(&self, user: &str, token: &str) -> Result<Vec<String>, StoreError> {
        self.track_user_session_at(user, token, Utc::now())
    }

    pub(crate) fn track_user_session_at(
        &self,
        user: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let key = session_key(token);
        let mut sessions = self.write_sessions();
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);

        let keys = index.entry(user.to_string()).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
        if keys.len() <= self.max_per_user {
            return Ok(Vec::new());
        }

        keys.retain(|k| sessions.get(k).is_some_and(|r| r.is_valid_at(now)));
        if keys.len() <= self.max_per_user {
            return Ok(Vec::new());
        }

        let excess = keys.len() - self.max_per_user;
        let evicted: Vec<String> = keys.drain(..excess).collect();
        let mut removed = Vec::with_capacity(evicted.len());
        for k in &evicted {
            if let Some(record) = sessions.remove(k) {
                removed.push(record);
            }
        }
        if let Err(err) = self.persist(&sessions) {
            for record in removed {
                sessions.insert(record.token_hash.clone(), record);
            }
            let keys = index.entry(user.to_string()).or_default();
            let mut restored = evicted;
            restored.append(keys);
            *keys = restored;
            return Err(err);
        }
        info!(user, evicted = evicted.len(), "Evicted oldest sessions over per-user limit");
        Ok(evicted)
    }

    /// Drop a single session key from a user's index without deleting the session.
    pub fn untrack_user_session(&self, user: &str, token: &str) {
        let key = session_key(token);
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(keys) = index.get_mut(user) {
            keys.retain(|k| *k != key);
        }
    }

    /// Delete every session owned by `user`. Returns the removed session keys.
    ///
    /// # Errors
    /// Returns an error if the file cannot be rewritten; nothing is removed.
    pub fn invalidate_all_for_user(&self, user: &str) -> Result<Vec<String>, StoreError> {
        let mut sessions = self.write_sessions();
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);

        let mut keys = index.remove(user).unwrap_or_default();
        for (key, record) in sessions.iter() {
            if record.username == user && !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        let mut removed = Vec::new();
        for key in &keys {
            if let Some(record) = sessions.remove(key) {
                removed.push(record);
            }
        }
        if let Err(err) = self.persist(&sessions) {
            for record in removed {
                sessions.insert(record.token_hash.clone(), record);
            }
            index.insert(user.to_string(), keys);
            return Err(err);
        }
        info!(user, sessions_invalidated = keys.len(), "Invalidated all user sessions");
        Ok(keys)
    }

    /// Sessions currently indexed for `user`.
    #[must_use]
    pub fn user_session_count(&self, user: &str) -> usize {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .map_or(0, Vec::len)
    }

    /// Mark a session as being refreshed. Returns `false` if it already was.
    pub fn set_refreshing(&self, token: &str, refreshing: bool) -> bool {
        let mut sessions = self.write_sessions();
        match sessions.get_mut(&session_key(token)) {
            Some(record) if refreshing && record.refreshing => false,
            Some(record) => {
                record.refreshing = refreshing;
                true
            }
            None => false,
        }
    }

    /// Store refreshed OIDC tokens and slide the session to cover them.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written; the previous tokens are kept.
    pub fn update_oidc_tokens(
        &self,
        token: &str,
        refresh_token: Option<String>,
        access_expiry: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let key = session_key(token);
        let mut sessions = self.write_sessions();
        let Some(record) = sessions.get_mut(&key) else {
            return Ok(false);
        };
        let previous = record.clone();
        if let Some(refresh_token) = refresh_token.filter(|t| !t.is_empty()) {
            record.oidc_refresh_token = Some(refresh_token);
        }
        record.oidc_access_expiry = Some(access_expiry);
        let extended = now + record.ttl();
        if extended > record.expires_at {
            record.expires_at = extended;
        }
        if let Err(err) = self.persist(&sessions) {
            sessions.insert(key, previous);
            return Err(err);
        }
        Ok(true)
    }

    /// Remove expired sessions. Returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        self.prune_expired_at(Utc::now())
    }

    pub(crate) fn prune_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.write_sessions();
        let before = sessions.len();
        sessions.retain(|_, record| record.is_valid_at(now));
        let dropped = before - sessions.len();
        if dropped > 0 {
            if let Err(err) = self.persist(&sessions) {
                warn!("Failed to persist session cleanup: {err}");
            }
            let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
            for keys in index.values_mut() {
                keys.retain(|k| sessions.contains_key(k));
            }
            index.retain(|_, keys| !keys.is_empty());
        }
        dropped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush the current state to disk.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn close(&self) -> Result<(), StoreError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        self.persist(&sessions)
    }
}
