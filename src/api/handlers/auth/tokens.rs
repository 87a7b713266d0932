//! API tokens and scopes.
//!
//! Tokens are stored in `<dataDir>/api_tokens.json` as SHA-256 hex hashes. A
//! token with no scopes is a legacy token and is treated as `*`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};
use tracing::{info, warn};
use uuid::Uuid;

use super::utils::{constant_time_eq, sha256_hex};
use crate::api::handlers::persist::{StoreError, load_json, save_json};

pub const API_TOKENS_FILE: &str = "api_tokens.json";

pub const SCOPE_WILDCARD: &str = "*";
pub const SCOPE_MONITORING_READ: &str = "monitoring:read";
pub const SCOPE_MONITORING_WRITE: &str = "monitoring:write";
pub const SCOPE_DOCKER_REPORT: &str = "docker:report";
pub const SCOPE_DOCKER_MANAGE: &str = "docker:manage";
pub const SCOPE_KUBERNETES_REPORT: &str = "kubernetes:report";
pub const SCOPE_KUBERNETES_MANAGE: &str = "kubernetes:manage";
pub const SCOPE_HOST_REPORT: &str = "host-agent:report";
pub const SCOPE_HOST_MANAGE: &str = "host-agent:manage";
pub const SCOPE_SETTINGS_READ: &str = "settings:read";
pub const SCOPE_SETTINGS_WRITE: &str = "settings:write";

pub const KNOWN_SCOPES: [&str; 11] = [
    SCOPE_WILDCARD,
    SCOPE_MONITORING_READ,
    SCOPE_MONITORING_WRITE,
    SCOPE_DOCKER_REPORT,
    SCOPE_DOCKER_MANAGE,
    SCOPE_KUBERNETES_REPORT,
    SCOPE_KUBERNETES_MANAGE,
    SCOPE_HOST_REPORT,
    SCOPE_HOST_MANAGE,
    SCOPE_SETTINGS_READ,
    SCOPE_SETTINGS_WRITE,
];

#[must_use]
pub fn is_known_scope(scope: &str) -> bool {
    KNOWN_SCOPES.contains(&scope)
}

fn normalize_scopes(scopes: &[String]) -> Vec<String> {
    if scopes.is_empty() {
        vec![SCOPE_WILDCARD.to_string()]
    } else {
        scopes.to_vec()
    }
}

fn token_prefix(value: &str) -> String {
    value.chars().take(6).collect()
}

fn token_suffix(value: &str) -> String {
    let count = value.chars().count();
    value.chars().skip(count.saturating_sub(4)).collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTokenRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub hash: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub org_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ApiTokenRecord {
    /// Build a record for a raw token. Only the hash is kept.
    #[must_use]
    pub fn new(raw: &str, name: &str, scopes: &[String]) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            hash: sha256_hex(raw),
            prefix: token_prefix(raw),
            suffix: token_suffix(raw),
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: None,
            scopes: normalize_scopes(scopes),
            org_id: None,
            org_ids: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_org(mut self, org_id: &str) -> Self {
        self.org_id = Some(org_id.to_string());
        self
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Empty `scope` is always granted; an empty list or `*` grants everything.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        if scope.is_empty() || self.scopes.is_empty() {
            return true;
        }
        self.scopes.iter().any(|s| s == SCOPE_WILDCARD || s == scope)
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| now >= expiry)
    }

    /// Bound tokens only reach their orgs; unbound tokens reach any org.
    #[must_use]
    pub fn can_access_org(&self, org_id: &str) -> bool {
        let bound: Vec<&str> = self
            .org_id
            .iter()
            .map(String::as_str)
            .chain(self.org_ids.iter().map(String::as_str))
            .filter(|id| !id.is_empty())
            .collect();
        bound.is_empty() || bound.contains(&org_id)
    }

    /// The org a bound token selects when the request names none.
    #[must_use]
    pub fn bound_org(&self) -> Option<&str> {
        self.org_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or_else(|| self.org_ids.first().map(String::as_str))
    }

    /// Principal name reported in `X-Authenticated-User`.
    #[must_use]
    pub fn principal_name(&self) -> String {
        if self.id.is_empty() {
            let short: String = self.hash.chars().take(8).collect();
            format!("token:legacy-{short}")
        } else {
            format!("token:{}", self.id)
        }
    }
}

#[derive(Debug)]
pub struct ApiTokenStore {
    path: Option<PathBuf>,
    tokens: RwLock<Vec<ApiTokenRecord>>,
}

impl ApiTokenStore {
    /// Load `<data_dir>/api_tokens.json`. Missing or empty files mean no tokens.
    ///
    /// # Errors
    /// Returns an error when the file holds invalid JSON.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join(API_TOKENS_FILE);
        let empty = std::fs::metadata(&path).is_ok_and(|meta| meta.len() == 0);
        let mut tokens: Vec<ApiTokenRecord> = if empty {
            Vec::new()
        } else {
            load_json(&path)?.unwrap_or_default()
        };
        for token in &mut tokens {
            token.scopes = normalize_scopes(&token.scopes);
        }
        if !tokens.is_empty() {
            info!(tokens = tokens.len(), "Loaded API tokens");
        }
        Ok(Self {
            path: Some(path),
            tokens: RwLock::new(tokens),
        })
    }

    #[must_use]
    pub fn in_memory(tokens: Vec<ApiTokenRecord>) -> Self {
        Self {
            path: None,
            tokens: RwLock::new(tokens),
        }
    }

    fn persist(&self, tokens: &[ApiTokenRecord]) -> Result<(), StoreError> {
        match &self.path {
            Some(path) => save_json(path, tokens),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn has_tokens(&self) -> bool {
        !self
            .tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Look up a raw token. Expired tokens do not validate.
    ///
    /// Returns a copy of the record with `last_used_at` refreshed.
    #[must_use]
    pub fn validate(&self, raw: &str) -> Option<ApiTokenRecord> {
        self.validate_at(raw, Utc::now())
    }

    pub(crate) fn validate_at(&self, raw: &str, now: DateTime<Utc>) -> Option<ApiTokenRecord> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let hash = sha256_hex(raw);
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let record = tokens
            .iter_mut()
            .find(|record| constant_time_eq(&record.hash, &hash))?;
        if record.is_expired_at(now) {
            warn!(token = %record.principal_name(), "Rejected expired API token");
            return None;
        }
        record.last_used_at = Some(now);
        Some(record.clone())
    }

    /// Add a token and persist.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written; the token is not added.
    pub fn add(&self, record: ApiTokenRecord) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens.push(record);
        if let Err(err) = self.persist(&tokens) {
            tokens.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Remove a token by id and persist.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written; the token is kept.
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let Some(position) = tokens.iter().position(|record| record.id == id) else {
            return Ok(false);
        };
        let removed = tokens.remove(position);
        if let Err(err) = self.persist(&tokens) {
            tokens.insert(position, removed);
            return Err(err);
        }
        Ok(true)
    }

    /// Flush `last_used_at` updates.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn close(&self) -> Result<(), StoreError> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        if tokens.is_empty() {
            return Ok(());
        }
        self.persist(&tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::Duration;

    #[test]
    fn has_scope_rules() {
        let mut record = ApiTokenRecord::new("secret", "t", &[SCOPE_MONITORING_READ.to_string()]);
        assert!(record.has_scope(SCOPE_MONITORING_READ));
        assert!(!record.has_scope(SCOPE_SETTINGS_WRITE));
        assert!(record.has_scope(""));

        record.scopes.clear();
        assert!(record.has_scope(SCOPE_SETTINGS_WRITE));

        record.scopes = vec![SCOPE_WILDCARD.to_string()];
        assert!(record.has_scope(SCOPE_SETTINGS_WRITE));
    }

    #[test]
    fn known_scopes_are_case_sensitive() {
        assert!(is_known_scope(SCOPE_HOST_MANAGE));
        assert!(is_known_scope(SCOPE_WILDCARD));
        assert!(!is_known_scope("MONITORING:READ"));
        assert!(!is_known_scope("monitoring"));
        assert!(!is_known_scope(""));
    }

    #[test]
    fn prefix_and_suffix() {
        assert_eq!(token_prefix("abcdefghij"), "abcdef");
        assert_eq!(token_prefix("abc"), "abc");
        assert_eq!(token_suffix("abcdefghij"), "ghij");
        assert_eq!(token_suffix("abc"), "abc");
        assert_eq!(token_suffix(""), "");
    }

    #[test]
    fn new_record_defaults_to_wildcard() {
        let record = ApiTokenRecord::new("my-secret-token-12345", "Test", &[]);
        assert!(!record.id.is_empty());
        assert_eq!(record.hash, sha256_hex("my-secret-token-12345"));
        assert_eq!(record.scopes, vec![SCOPE_WILDCARD.to_string()]);
        assert_eq!(record.prefix, "my-sec");
        assert_eq!(record.suffix, "2345");
    }

    #[test]
    fn validate_matches_hash_and_rejects_expired() {
        let now = Utc::now();
        let live = ApiTokenRecord::new("live-token", "live", &[]);
        let expired = ApiTokenRecord::new("old-token", "old", &[]).with_expiry(now - Duration::minutes(1));
        let store = ApiTokenStore::in_memory(vec![live.clone(), expired]);

        let found = store.validate_at("live-token", now);
        assert_eq!(found.as_ref().map(|r| r.id.as_str()), Some(live.id.as_str()));
        assert_eq!(found.and_then(|r| r.last_used_at), Some(now));
        assert!(store.validate_at("old-token", now).is_none());
        assert!(store.validate_at("unknown", now).is_none());
        assert!(store.validate_at("", now).is_none());
    }

    #[test]
    fn org_binding() {
        let unbound = ApiTokenRecord::new("a", "a", &[]);
        assert!(unbound.can_access_org("acme"));
        assert!(unbound.bound_org().is_none());

        let bound = ApiTokenRecord::new("b", "b", &[]).with_org("acme");
        assert!(bound.can_access_org("acme"));
        assert!(!bound.can_access_org("beta"));
        assert_eq!(bound.bound_org(), Some("acme"));

        let mut multi = ApiTokenRecord::new("c", "c", &[]);
        multi.org_ids = vec!["acme".to_string(), "beta".to_string()];
        assert!(multi.can_access_org("beta"));
        assert!(!multi.can_access_org("gamma"));
    }

    #[test]
    fn principal_name_falls_back_to_hash() {
        let mut record = ApiTokenRecord::new("x", "x", &[]);
        record.id = "abc".to_string();
        assert_eq!(record.principal_name(), "token:abc");
        record.id.clear();
        record.hash = "0123456789abcdef".to_string();
        assert_eq!(record.principal_name(), "token:legacy-01234567");
    }

    #[test]
    fn open_applies_legacy_scopes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join(API_TOKENS_FILE),
            r#"[{"id":"legacy","name":"legacy","hash":"abc","createdAt":"2024-01-01T00:00:00Z"}]"#,
        )?;
        let store = ApiTokenStore::open(dir.path())?;
        assert!(store.has_tokens());
        let tokens = store.tokens.read().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(tokens[0].scopes, vec![SCOPE_WILDCARD.to_string()]);
        Ok(())
    }

    #[test]
    fn open_handles_missing_empty_and_invalid_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(!ApiTokenStore::open(dir.path())?.has_tokens());

        std::fs::write(dir.path().join(API_TOKENS_FILE), b"")?;
        assert!(!ApiTokenStore::open(dir.path())?.has_tokens());

        std::fs::write(dir.path().join(API_TOKENS_FILE), b"not valid json")?;
        assert!(ApiTokenStore::open(dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn add_persists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ApiTokenStore::open(dir.path())?;
        store.add(ApiTokenRecord::new("fresh-token", "fresh", &[]))?;
        let reloaded = ApiTokenStore::open(dir.path())?;
        assert!(reloaded.validate("fresh-token").is_some());
        let content = std::fs::read_to_string(dir.path().join(API_TOKENS_FILE))?;
        assert!(!content.contains("fresh-token"));
        Ok(())
    }

    #[test]
    fn remove_persists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ApiTokenStore::open(dir.path())?;
        let record = ApiTokenRecord::new("short-lived-token", "tmp", &[]);
        let id = record.id.clone();
        store.add(record)?;
        assert!(store.remove(&id)?);
        assert!(!store.remove(&id)?);
        assert!(!ApiTokenStore::open(dir.path())?.has_tokens());
        Ok(())
    }
}
