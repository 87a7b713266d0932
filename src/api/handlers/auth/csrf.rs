//! CSRF token store and the `check_csrf` middleware.
//!
//! Entries are keyed by `sha256(session token)` and hold `sha256(csrf token)`,
//! so neither raw value is ever written to `csrf_tokens.json`.

use axum::{
    Json,
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header::CONTENT_TYPE, header::SET_COOKIE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
    time::Duration as StdDuration,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    cookies::{self, COOKIE_MAX_AGE_SECONDS, SESSION_COOKIE},
    network::peer_info,
    sessions::session_key,
    state::AuthState,
    utils::{constant_time_eq, generate_token, safe_prefix, sha256_hex},
};
use crate::api::handlers::persist::{StoreError, load_json, save_json};

pub const CSRF_FILE: &str = "csrf_tokens.json";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_FORM_FIELD: &str = "csrf_token";
pub const CSRF_TTL_HOURS: i64 = 24;
pub const CSRF_CLEANUP_INTERVAL: StdDuration = StdDuration::from_secs(10 * 60);
const FORM_BODY_LIMIT: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfRecord {
    pub token_hash: String,
    pub session_key: String,
    pub expires_at: DateTime<Utc>,
}

/// Pre-hashing on-disk entry, keyed by raw session ID.
#[derive(Debug, Deserialize)]
struct LegacyCsrfRecord {
    #[serde(alias = "Token")]
    token: String,
    #[serde(rename = "expiresAt", alias = "ExpiresAt", alias = "expires_at")]
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CsrfStore {
    path: Option<PathBuf>,
    ttl: Duration,
    tokens: RwLock<HashMap<String, CsrfRecord>>,
}

impl CsrfStore {
    /// Load `<data_dir>/csrf_tokens.json`.
    ///
    /// The current array format is tried first, then the legacy map keyed by
    /// raw session ID. Legacy entries are hashed and rewritten in the current
    /// format. A missing or unreadable file yields an empty store.
    #[must_use]
    pub fn open(data_dir: &Path) -> Self {
        let path = data_dir.join(CSRF_FILE);
        let store = Self::with_path(Some(path.clone()));
        let now = Utc::now();

        let current: Result<Option<Vec<CsrfRecord>>, StoreError> = load_json(&path);
        match current {
            Ok(Some(records)) => {
                let mut tokens = store.write();
                for record in records.into_iter().filter(|r| r.expires_at > now) {
                    tokens.insert(record.session_key.clone(), record);
                }
                info!(tokens = tokens.len(), "Loaded CSRF tokens");
            }
            Ok(None) => {}
            Err(StoreError::Serde { .. }) => match load_json::<HashMap<String, LegacyCsrfRecord>>(&path) {
                Ok(Some(legacy)) => {
                    let migrated = migrate_legacy(legacy, now);
                    let count = migrated.len();
                    {
                        let mut tokens = store.write();
                        *tokens = migrated;
                        if let Err(err) = store.persist(&tokens) {
                            warn!("Failed to rewrite migrated CSRF tokens: {err}");
                        }
                    }
                    info!(tokens = count, "Migrated legacy CSRF token file");
                }
                Ok(None) => {}
                Err(err) => warn!("Ignoring unreadable CSRF token file: {err}"),
            },
            Err(err) => warn!("Ignoring unreadable CSRF token file: {err}"),
        }
        store
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_path(None)
    }

    fn with_path(path: Option<PathBuf>) -> Self {
        Self {
            path,
            ttl: Duration::hours(CSRF_TTL_HOURS),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CsrfRecord>> {
        self.tokens.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, tokens: &HashMap<String, CsrfRecord>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut records: Vec<&CsrfRecord> = tokens.values().collect();
        records.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        save_json(path, &records)
    }

    /// Issue a fresh token for a session, replacing any previous one.
    ///
    /// # Errors
    /// Returns an error if randomness or persistence fails.
    pub fn generate(&self, session_id: &str) -> Result<String, StoreError> {
        self.generate_at(session_id, Utc::now())
    }

    pub(crate) fn generate_at(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let raw = generate_token().map_err(|err| StoreError::Random(err.to_string()))?;
        let key = session_key(session_id);
        let record = CsrfRecord {
            token_hash: sha256_hex(&raw),
            session_key: key.clone(),
            expires_at: now + self.ttl,
        };
        let mut tokens = self.write();
        let previous = tokens.insert(key.clone(), record);
        if let Err(err) = self.persist(&tokens) {
            match previous {
                Some(previous) => tokens.insert(key, previous),
                None => tokens.remove(&key),
            };
            return Err(err);
        }
        Ok(raw)
    }

    #[must_use]
    pub fn validate(&self, session_id: &str, raw_token: &str) -> bool {
        self.validate_at(session_id, raw_token, Utc::now())
    }

    pub(crate) fn validate_at(&self, session_id: &str, raw_token: &str, now: DateTime<Utc>) -> bool {
        if raw_token.is_empty() {
            return false;
        }
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        tokens
            .get(&session_key(session_id))
            .is_some_and(|record| {
                now < record.expires_at && constant_time_eq(&record.token_hash, &sha256_hex(raw_token))
            })
    }

    pub fn delete(&self, session_id: &str) {
        self.delete_key(&session_key(session_id));
    }

    /// Drop the token stored under an already hashed session key.
    pub fn delete_key(&self, key: &str) {
        let mut tokens = self.write();
        if tokens.remove(key).is_some() {
            if let Err(err) = self.persist(&tokens) {
                warn!("Failed to persist CSRF token removal: {err}");
            }
        }
    }

    /// Evict expired entries. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    pub(crate) fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let mut tokens = self.write();
        let before = tokens.len();
        tokens.retain(|_, record| now < record.expires_at);
        let removed = before - tokens.len();
        if removed > 0 {
            if let Err(err) = self.persist(&tokens) {
                warn!("Failed to persist CSRF cleanup: {err}");
            }
            debug!(removed, "Evicted expired CSRF tokens");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush to disk.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn close(&self) -> Result<(), StoreError> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        self.persist(&tokens)
    }
}

fn migrate_legacy(
    legacy: HashMap<String, LegacyCsrfRecord>,
    now: DateTime<Utc>,
) -> HashMap<String, CsrfRecord> {
    legacy
        .into_iter()
        .filter(|(_, record)| record.expires_at > now && !record.token.is_empty())
        .map(|(session_id, record)| {
            let key = session_key(&session_id);
            (
                key.clone(),
                CsrfRecord {
                    token_hash: sha256_hex(&record.token),
                    session_key: key,
                    expires_at: record.expires_at,
                },
            )
        })
        .collect()
}

/// Periodically evict expired CSRF tokens until the handle is aborted.
pub fn spawn_cleanup(store: Arc<CsrfStore>, every: StdDuration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            store.cleanup();
        }
    })
}

/// Requests that carry their own credentials instead of a session cookie.
fn stateless_auth(headers: &HeaderMap) -> bool {
    if headers
        .get("x-api-token")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.is_empty())
    {
        return true;
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .is_some_and(|v| v.starts_with("basic ") || v.starts_with("bearer "))
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

/// Reject state-changing session requests without a valid CSRF token.
///
/// A rejection clears the CSRF cookie and issues a fresh token on the same
/// response (cookie and `X-CSRF-Token`) so the client can retry.
pub async fn check_csrf(
    State(state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    if matches!(*request.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return next.run(request).await;
    }
    let path = request.uri().path().to_string();
    if stateless_auth(request.headers()) {
        debug!(path, "CSRF check skipped: stateless credentials");
        return next.run(request).await;
    }
    let Some(session) = cookies::read_cookie(request.headers(), SESSION_COOKIE) else {
        debug!(path, "CSRF check skipped: no session cookie");
        return next.run(request).await;
    };

    let mut request = request;
    let mut provided = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string);

    if provided.is_none() && is_form(request.headers()) {
        let (parts, body) = request.into_parts();
        let bytes = match to_bytes(body, FORM_BODY_LIMIT).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(json!({"error": "Request body too large"})),
                )
                    .into_response();
            }
        };
        provided = url::form_urlencoded::parse(&bytes)
            .find(|(key, _)| key == CSRF_FORM_FIELD)
            .map(|(_, value)| value.into_owned())
            .filter(|v| !v.is_empty());
        request = Request::from_parts(parts, Body::from(bytes));
    }

    match provided {
        Some(token) if state.csrf().validate(&session, &token) => {
            debug!(path, session = %safe_prefix(&session, 8), "CSRF validation successful");
            next.run(request).await
        }
        Some(token) => {
            warn!(
                target: "security",
                path,
                session = %safe_prefix(&session, 8),
                provided_token = %safe_prefix(&token, 8),
                "Invalid CSRF token"
            );
            reject(&state, &request, &session)
        }
        None => {
            warn!(target: "security", path, session = %safe_prefix(&session, 8), "Missing CSRF token");
            reject(&state, &request, &session)
        }
    }
}

fn reject(state: &AuthState, request: &Request, session: &str) -> Response {
    let settings = state.cookie_settings(request.headers(), peer_info(request.extensions()));
    let mut response = (
        StatusCode::FORBIDDEN,
        Json(json!({"error": "CSRF token validation failed"})),
    )
        .into_response();
    let headers = response.headers_mut();
    if let Ok(cleared) = cookies::clear_csrf_cookie(settings) {
        headers.append(SET_COOKIE, cleared);
    }
    if !state.sessions().validate(session) {
        return response;
    }
    match state.csrf().generate(session) {
        Ok(fresh) => {
            if let Ok(cookie) = cookies::csrf_cookie(&fresh, settings, COOKIE_MAX_AGE_SECONDS) {
                headers.append(SET_COOKIE, cookie);
            }
            if let Ok(value) = HeaderValue::from_str(&fresh) {
                headers.insert(CSRF_HEADER, value);
            }
            debug!(new_token = %safe_prefix(&fresh, 8), "Issued new CSRF token");
        }
        Err(err) => warn!("Failed to issue replacement CSRF token: {err}"),
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn generate_validate_delete() -> Result<()> {
        let store = CsrfStore::in_memory();
        let token = store.generate("session-a")?;
        assert!(store.validate("session-a", &token));
        assert!(!store.validate("session-b", &token));
        assert!(!store.validate("session-a", "wrong"));
        assert!(!store.validate("session-a", ""));
        store.delete("session-a");
        assert!(!store.validate("session-a", &token));
        Ok(())
    }

    #[test]
    fn regenerate_replaces_previous() -> Result<()> {
        let store = CsrfStore::in_memory();
        let first = store.generate("s")?;
        let second = store.generate("s")?;
        assert!(!store.validate("s", &first));
        assert!(store.validate("s", &second));
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn expired_token_is_invalid_and_cleaned() -> Result<()> {
        let store = CsrfStore::in_memory();
        let now = Utc::now();
        let token = store.generate_at("s", now)?;
        let expiry = now + Duration::hours(CSRF_TTL_HOURS);
        assert!(store.validate_at("s", &token, expiry - Duration::nanoseconds(1)));
        assert!(!store.validate_at("s", &token, expiry));
        assert_eq!(store.cleanup_at(expiry), 1);
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn file_never_contains_raw_values() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CsrfStore::open(dir.path());
        let token = store.generate("raw-session")?;
        let content = std::fs::read_to_string(dir.path().join(CSRF_FILE))?;
        assert!(!content.contains(&token));
        assert!(!content.contains("raw-session"));
        assert!(content.contains("tokenHash"));
        assert!(content.contains("sessionKey"));

        let reloaded = CsrfStore::open(dir.path());
        assert!(reloaded.validate("raw-session", &token));
        Ok(())
    }

    #[test]
    fn legacy_file_is_migrated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let live = (Utc::now() + Duration::hours(2)).to_rfc3339();
        let dead = (Utc::now() - Duration::hours(2)).to_rfc3339();
        let legacy = json!({
            "session-live": {"token": "tok-live", "sessionId": "session-live", "expiresAt": live},
            "session-dead": {"token": "tok-dead", "sessionId": "session-dead", "expiresAt": dead},
        });
        std::fs::write(dir.path().join(CSRF_FILE), serde_json::to_vec(&legacy)?)?;

        let store = CsrfStore::open(dir.path());
        assert_eq!(store.len(), 1);
        assert!(store.validate("session-live", "tok-live"));
        assert!(!store.validate("session-dead", "tok-dead"));

        let content = std::fs::read_to_string(dir.path().join(CSRF_FILE))?;
        assert!(!content.contains("tok-live"));
        let reloaded = CsrfStore::open(dir.path());
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.validate("session-live", "tok-live"));
        Ok(())
    }

    #[test]
    fn corrupt_file_is_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(CSRF_FILE), b"not json at all")?;
        let store = CsrfStore::open(dir.path());
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn stateless_auth_detection() {
        let mut headers = HeaderMap::new();
        assert!(!stateless_auth(&headers));
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert!(stateless_auth(&headers));
        headers.insert("authorization", HeaderValue::from_static("basic Zm9vOmJhcg=="));
        assert!(stateless_auth(&headers));
        headers.insert("authorization", HeaderValue::from_static("Digest foo"));
        assert!(!stateless_auth(&headers));
        headers.insert("x-api-token", HeaderValue::from_static("tok"));
        assert!(stateless_auth(&headers));
    }
}
