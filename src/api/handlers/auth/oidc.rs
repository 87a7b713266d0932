//! Background OIDC token refresh for OIDC-backed sessions.
//!
//! A refresh is scheduled when the access token is within five minutes of
//! expiring. At most one refresh runs per session token; it gets its own 30 s
//! deadline and never affects the request that triggered it. A failed refresh
//! deletes the session.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration as StdDuration,
};
use tracing::{debug, info, warn};

use super::{
    csrf::CsrfStore,
    sessions::{SessionRecord, SessionStore, session_key},
};
use crate::api::handlers::audit::{AuditDispatcher, AuditEvent};

pub const REFRESH_MARGIN_MINUTES: i64 = 5;
pub const REFRESH_TIMEOUT: StdDuration = StdDuration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    #[error("token endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned {0}")]
    Status(reqwest::StatusCode),
    #[error("refresh timed out")]
    Timeout,
}

#[derive(Clone, Debug)]
pub struct RefreshedTokens {
    pub refresh_token: Option<String>,
    pub access_expiry: DateTime<Utc>,
}

/// Exchanges a refresh token at the identity provider.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedTokens, OidcError>> + Send + 'a>>;
}

/// OIDC client settings needed for refresh.
#[derive(Clone, Debug)]
pub struct OidcSettings {
    pub issuer_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// `grant_type=refresh_token` against the configured token endpoint.
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    settings: OidcSettings,
}

impl HttpTokenRefresher {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(settings: OidcSettings) -> Result<Self, OidcError> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(REFRESH_TIMEOUT)
            .build()?;
        Ok(Self { client, settings })
    }
}

impl TokenRefresher for HttpTokenRefresher {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedTokens, OidcError>> + Send + 'a>> {
        Box::pin(async move {
            let params = [
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.expose_secret()),
            ];
            let response = self
                .client
                .post(&self.settings.token_url)
                .form(&params)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(OidcError::Status(response.status()));
            }
            let body: TokenResponse = response.json().await?;
            Ok(RefreshedTokens {
                refresh_token: body.refresh_token,
                access_expiry: Utc::now() + Duration::seconds(body.expires_in.unwrap_or(3600)),
            })
        })
    }
}

/// Whether a session's access token is close enough to expiry to refresh.
#[must_use]
pub fn needs_refresh(record: &SessionRecord, now: DateTime<Utc>) -> bool {
    record.oidc_refresh_token.as_deref().is_some_and(|t| !t.is_empty())
        && record
            .oidc_access_expiry
            .is_none_or(|expiry| now + Duration::minutes(REFRESH_MARGIN_MINUTES) > expiry)
}

/// Per-token refresh coordinator.
pub struct OidcRefresher {
    issuer: String,
    refresher: Arc<dyn TokenRefresher>,
    in_flight: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for OidcRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcRefresher")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

/// Stores a refresh task needs after the request is gone.
#[derive(Clone)]
pub struct RefreshTargets {
    pub sessions: Arc<SessionStore>,
    pub csrf: Arc<CsrfStore>,
    pub audit: Arc<AuditDispatcher>,
}

impl OidcRefresher {
    #[must_use]
    pub fn new(issuer: String, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            issuer,
            refresher,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string())
    }

    fn release(&self, key: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    #[must_use]
    pub fn is_refreshing(&self, token: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&session_key(token))
    }

    /// Spawn a detached refresh unless one is already running for this token.
    ///
    /// Returns whether a task was spawned.
    pub fn schedule(
        self: &Arc<Self>,
        targets: RefreshTargets,
        token: String,
        record: SessionRecord,
    ) -> bool {
        let key = session_key(&token);
        if !self.claim(&key) {
            return false;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(&targets, &token, &record).await;
            this.release(&key);
        });
        true
    }

    /// Refresh one session. Exposed for tests; production code uses [`Self::schedule`].
    pub(crate) async fn run(&self, targets: &RefreshTargets, token: &str, record: &SessionRecord) {
        if !targets.sessions.set_refreshing(token, true) {
            debug!("OIDC refresh already marked for session");
            return;
        }
        self.refresh_once(targets, token, record).await;
        targets.sessions.set_refreshing(token, false);
    }

    async fn refresh_once(&self, targets: &RefreshTargets, token: &str, record: &SessionRecord) {
        let user = record.username.as_str();
        if record.oidc_issuer.as_deref() != Some(self.issuer.as_str()) {
            warn!(
                session_issuer = record.oidc_issuer.as_deref().unwrap_or_default(),
                config_issuer = %self.issuer,
                "OIDC issuer mismatch, invalidating session"
            );
            self.invalidate(targets, token, user, "Issuer mismatch");
            return;
        }
        let Some(refresh_token) = record.oidc_refresh_token.as_deref() else {
            return;
        };
        debug!(issuer = %self.issuer, "Attempting OIDC token refresh");

        let result = match tokio::time::timeout(REFRESH_TIMEOUT, self.refresher.refresh(refresh_token)).await {
            Ok(result) => result,
            Err(_) => Err(OidcError::Timeout),
        };
        match result {
            Ok(tokens) => {
                match targets
                    .sessions
                    .update_oidc_tokens(token, tokens.refresh_token, tokens.access_expiry)
                {
                    Ok(_) => {
                        info!(user, new_expiry = %tokens.access_expiry, "OIDC token refresh successful");
                        targets.audit.log(
                            AuditEvent::new("oidc_token_refresh")
                                .user(user)
                                .success(true)
                                .details("Token refreshed successfully"),
                        );
                    }
                    Err(err) => warn!("Failed to persist refreshed OIDC tokens: {err}"),
                }
            }
            Err(err) => {
                warn!(user, "OIDC token refresh failed, invalidating session: {err}");
                self.invalidate(targets, token, user, &format!("Token refresh failed: {err}"));
            }
        }
    }

    fn invalidate(&self, targets: &RefreshTargets, token: &str, user: &str, details: &str) {
        if let Err(err) = targets.sessions.delete(token) {
            warn!("Failed to delete session after OIDC refresh failure: {err}");
        }
        targets.csrf.delete(token);
        targets.audit.log(
            AuditEvent::new("oidc_token_refresh")
                .user(user)
                .success(false)
                .details(details),
        );
    }
}
