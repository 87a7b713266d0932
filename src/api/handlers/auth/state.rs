//! Auth configuration and the shared state every auth layer reads.

use anyhow::Context;
use axum::http::HeaderMap;
use chrono::Duration;
use secrecy::SecretString;
use std::{net::IpAddr, path::Path, sync::Arc, time::Duration as StdDuration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    bootstrap::BootstrapToken,
    bypass,
    cookies::{self, CookieSettings},
    csrf::CsrfStore,
    lockout::LockoutLedger,
    network::{self, PeerInfo, TrustedProxies},
    oidc::{OidcRefresher, RefreshTargets},
    password::CredentialStore,
    rate_limit::{QuotaRateLimiter, RateLimiter},
    sessions::SessionStore,
    tokens::ApiTokenStore,
};
use crate::api::handlers::{audit::AuditDispatcher, persist::StoreError};

const DEFAULT_SESSION_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_ROLE_SEPARATOR: &str = "|";
const DEFAULT_ADMIN_ROLE: &str = "admin";

/// Period of the background pruning task.
pub const MAINTENANCE_INTERVAL: StdDuration = StdDuration::from_secs(5 * 60);

/// Reverse-proxy authentication settings.
#[derive(Clone, Debug)]
pub struct ProxyAuthConfig {
    secret: SecretString,
    user_header: Option<String>,
    role_header: Option<String>,
    role_separator: String,
    admin_role: String,
}

impl ProxyAuthConfig {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            user_header: None,
            role_header: None,
            role_separator: DEFAULT_ROLE_SEPARATOR.to_string(),
            admin_role: DEFAULT_ADMIN_ROLE.to_string(),
        }
    }

    #[must_use]
    pub fn with_user_header(mut self, header: Option<String>) -> Self {
        self.user_header = header.filter(|h| !h.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_role_header(mut self, header: Option<String>) -> Self {
        self.role_header = header.filter(|h| !h.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_role_separator(mut self, separator: String) -> Self {
        if !separator.is_empty() {
            self.role_separator = separator;
        }
        self
    }

    #[must_use]
    pub fn with_admin_role(mut self, role: String) -> Self {
        if !role.trim().is_empty() {
            self.admin_role = role;
        }
        self
    }

    pub(super) fn secret(&self) -> &SecretString {
        &self.secret
    }

    #[must_use]
    pub fn user_header(&self) -> Option<&str> {
        self.user_header.as_deref()
    }

    #[must_use]
    pub fn role_header(&self) -> Option<&str> {
        self.role_header.as_deref()
    }

    #[must_use]
    pub fn role_separator(&self) -> &str {
        &self.role_separator
    }

    #[must_use]
    pub fn admin_role(&self) -> &str {
        &self.admin_role
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    session_ttl_seconds: i64,
    proxy: Option<ProxyAuthConfig>,
    oidc_enabled: bool,
    hosted: bool,
    strict_forwarded_proto: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            proxy: None,
            oidc_enabled: false,
            hosted: false,
            strict_forwarded_proto: false,
        }
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        if seconds > 0 {
            self.session_ttl_seconds = seconds;
        }
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: Option<ProxyAuthConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    #[must_use]
    pub fn with_oidc_enabled(mut self, enabled: bool) -> Self {
        self.oidc_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_hosted(mut self, hosted: bool) -> Self {
        self.hosted = hosted;
        self
    }

    #[must_use]
    pub fn with_strict_forwarded_proto(mut self, strict: bool) -> Self {
        self.strict_forwarded_proto = strict;
        self
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl_seconds)
    }

    #[must_use]
    pub fn proxy(&self) -> Option<&ProxyAuthConfig> {
        self.proxy.as_ref()
    }

    #[must_use]
    pub fn oidc_enabled(&self) -> bool {
        self.oidc_enabled
    }

    #[must_use]
    pub fn hosted(&self) -> bool {
        self.hosted
    }

    #[must_use]
    pub fn strict_forwarded_proto(&self) -> bool {
        self.strict_forwarded_proto
    }
}

/// Persistent stores behind the auth pipeline.
pub struct AuthStores {
    pub sessions: Arc<SessionStore>,
    pub csrf: Arc<CsrfStore>,
    pub tokens: ApiTokenStore,
    pub credentials: CredentialStore,
}

impl AuthStores {
    /// Load every store from `data_dir`.
    ///
    /// # Errors
    /// Returns an error if the session or token files are unreadable, or the
    /// configured password cannot be hashed.
    pub fn open(data_dir: &Path, configured: Option<(&str, &SecretString)>) -> anyhow::Result<Self> {
        Ok(Self {
            sessions: Arc::new(SessionStore::open(data_dir).context("Failed to load sessions")?),
            csrf: Arc::new(CsrfStore::open(data_dir)),
            tokens: ApiTokenStore::open(data_dir).context("Failed to load API tokens")?,
            credentials: CredentialStore::open(data_dir, configured)
                .context("Failed to load local credentials")?,
        })
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(SessionStore::in_memory()),
            csrf: Arc::new(CsrfStore::in_memory()),
            tokens: ApiTokenStore::in_memory(Vec::new()),
            credentials: CredentialStore::in_memory(None),
        }
    }
}

pub struct AuthState {
    config: AuthConfig,
    proxies: TrustedProxies,
    admin_bypass: bool,
    sessions: Arc<SessionStore>,
    csrf: Arc<CsrfStore>,
    tokens: ApiTokenStore,
    credentials: CredentialStore,
    lockout: LockoutLedger,
    rate_limiter: Arc<dyn RateLimiter>,
    bootstrap: BootstrapToken,
    audit: Arc<AuditDispatcher>,
    oidc: Option<Arc<OidcRefresher>>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("config", &self.config)
            .field("trusted_proxies", &self.proxies.len())
            .field("admin_bypass", &self.admin_bypass)
            .finish_non_exhaustive()
    }
}

impl AuthState {
    pub fn new(config: AuthConfig, stores: AuthStores) -> Self {
        Self {
            config,
            proxies: TrustedProxies::from_env(),
            admin_bypass: bypass::enabled(),
            sessions: stores.sessions,
            csrf: stores.csrf,
            tokens: stores.tokens,
            credentials: stores.credentials,
            lockout: LockoutLedger::default(),
            rate_limiter: Arc::new(QuotaRateLimiter::default()),
            bootstrap: BootstrapToken::default(),
            audit: Arc::new(AuditDispatcher::console()),
            oidc: None,
        }
    }

    #[must_use]
    pub fn with_trusted_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.proxies = proxies;
        self
    }

    #[must_use]
    pub fn with_admin_bypass(mut self, enabled: bool) -> Self {
        self.admin_bypass = enabled;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    #[must_use]
    pub fn with_lockout(mut self, lockout: LockoutLedger) -> Self {
        self.lockout = lockout;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditDispatcher>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_oidc(mut self, refresher: Option<Arc<OidcRefresher>>) -> Self {
        self.oidc = refresher;
        self
    }

    /// Issue or purge the bootstrap token depending on configured auth.
    #[must_use]
    pub fn with_bootstrap(mut self, data_dir: &Path) -> Self {
        let configured = self.auth_configured();
        self.bootstrap = BootstrapToken::initialize(data_dir, configured, self.config.hosted());
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    #[must_use]
    pub fn csrf(&self) -> &Arc<CsrfStore> {
        &self.csrf
    }

    #[must_use]
    pub fn tokens(&self) -> &ApiTokenStore {
        &self.tokens
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    #[must_use]
    pub fn lockout(&self) -> &LockoutLedger {
        &self.lockout
    }

    pub(crate) fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }

    #[must_use]
    pub fn bootstrap(&self) -> &BootstrapToken {
        &self.bootstrap
    }

    #[must_use]
    pub fn audit(&self) -> &Arc<AuditDispatcher> {
        &self.audit
    }

    #[must_use]
    pub fn proxies(&self) -> &TrustedProxies {
        &self.proxies
    }

    pub(crate) fn admin_bypass(&self) -> bool {
        self.admin_bypass
    }

    pub(crate) fn oidc(&self) -> Option<&Arc<OidcRefresher>> {
        self.oidc.as_ref()
    }

    pub(crate) fn refresh_targets(&self) -> RefreshTargets {
        RefreshTargets {
            sessions: Arc::clone(&self.sessions),
            csrf: Arc::clone(&self.csrf),
            audit: Arc::clone(&self.audit),
        }
    }

    /// Any mechanism that can authenticate a request.
    #[must_use]
    pub fn auth_configured(&self) -> bool {
        self.credentials.is_configured()
            || self.tokens.has_tokens()
            || self.config.proxy().is_some()
            || self.config.oidc_enabled()
    }

    #[must_use]
    pub fn client_ip(&self, headers: &HeaderMap, peer: Option<PeerInfo>) -> Option<IpAddr> {
        network::client_ip(headers, peer.map(|p| p.ip()), &self.proxies)
    }

    #[must_use]
    pub fn cookie_settings(&self, headers: &HeaderMap, peer: Option<PeerInfo>) -> CookieSettings {
        cookies::cookie_settings(
            headers,
            peer,
            &self.proxies,
            self.config.strict_forwarded_proto(),
        )
    }

    /// Track a new session and drop the CSRF tokens of evicted ones.
    ///
    /// # Errors
    /// Returns an error if evicted sessions cannot be removed from disk.
    pub fn track_session(&self, user: &str, token: &str) -> Result<(), StoreError> {
        let evicted = self.sessions.track_user_session(user, token)?;
        if !evicted.is_empty() {
            info!(user, evicted = evicted.len(), "Evicted oldest sessions over the per-user cap");
        }
        for key in evicted {
            self.csrf.delete_key(&key);
        }
        Ok(())
    }

    /// Delete every session of `user` along with their CSRF tokens.
    ///
    /// Returns how many sessions were removed.
    ///
    /// # Errors
    /// Returns an error if the session file cannot be rewritten; nothing is removed.
    pub fn invalidate_user_sessions(&self, user: &str) -> Result<usize, StoreError> {
        let removed = self.sessions.invalidate_all_for_user(user)?;
        for key in &removed {
            self.csrf.delete_key(key);
        }
        Ok(removed.len())
    }

    /// Prune expired state from the in-memory auth tables.
    pub fn prune_expired(&self) {
        let sessions = self.sessions.prune_expired();
        self.lockout.prune();
        self.rate_limiter.prune();
        debug!(sessions, "Auth maintenance pass complete");
    }

    /// Flush stores on shutdown.
    pub fn close(&self) {
        if let Err(err) = self.sessions.close() {
            warn!("Failed to flush session store: {err}");
        }
        if let Err(err) = self.csrf.close() {
            warn!("Failed to flush CSRF store: {err}");
        }
        if let Err(err) = self.tokens.close() {
            warn!("Failed to flush API token store: {err}");
        }
        self.audit.close();
    }
}

/// Run [`AuthState::prune_expired`] every `every` until aborted.
pub fn spawn_maintenance(state: Arc<AuthState>, every: StdDuration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            state.prune_expired();
        }
    })
}
