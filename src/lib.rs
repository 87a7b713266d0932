//! # Pulse (authentication, sessions and tenant authorization)
//!
//! `pulse` is the HTTP gatekeeper of the Pulse control plane. Every request passes
//! through one pipeline that decides who is calling, which organization the call
//! belongs to, and whether the caller may perform the requested action.
//!
//! ## Authentication
//!
//! A request is authenticated by the first mechanism that matches, in this order:
//! development bypass, reverse-proxy identity (`X-Proxy-Secret`), OIDC session
//! cookie, API token (`X-API-Token`, `Authorization: Bearer`, or `?token=` for
//! WebSocket upgrades), local session cookie (`pulse_session`), and finally HTTP
//! Basic credentials for the configured local user.
//!
//! - **Sessions:** opaque 32-byte hex tokens with sliding expiration. Only
//!   `sha256(token)` is persisted in `sessions.json`.
//! - **CSRF:** every session owns a CSRF token; the store keeps
//!   `sha256(session)` → `sha256(token)` in `csrf_tokens.json`.
//! - **Lockout:** 5 failed logins lock the username and the client IP for
//!   15 minutes.
//! - **Bootstrap:** when no authentication is configured a one-time token is
//!   written to `<dataDir>/.bootstrap_token` to unlock first-boot setup.
//!
//! ## Tenants
//!
//! Each request resolves an organization ID (`default` unless the caller selects
//! another through `X-Pulse-Org-ID`, a bound API token, or the session). Tenant
//! resources (monitor handle, RBAC manager, audit logger) are created lazily per
//! organization and closed on shutdown.
//!
//! ## Authorization
//!
//! Routes compose `require_auth`, `require_admin`, `require_permission` and
//! `require_scope` layers. API tokens are additionally limited by their scopes.

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
