//! Authentication, sessions and CSRF.
//!
//! This module decides who is calling and keeps the state that survives
//! between requests: sessions, CSRF tokens, the failed-login ledger, API
//! tokens, local credentials and the first-boot bootstrap token.
//!
//! ## Sessions
//!
//! Session tokens are 32 random bytes, hex encoded, returned in the
//! `pulse_session` cookie. `sessions.json` only stores `sha256(token)`. A
//! session is extended when less than half of its TTL remains. Each user keeps
//! at most 10 sessions; the oldest is evicted first.
//!
//! ## CSRF
//!
//! State-changing requests that ride on a session cookie must send the
//! matching `X-CSRF-Token` header (or `csrf_token` form field). Requests that
//! authenticate with an API token or Basic credentials are exempt. A rejection
//! issues a fresh token on the same response.
//!
//! ## Lockout
//!
//! Five failed logins lock both the username and the client IP for 15 minutes.
//! `/api/login` is also rate limited to 10 attempts per minute per IP. A
//! background task prunes both tables every five minutes.
//!
//! ## Bootstrap
//!
//! When nothing can authenticate a request, `<dataDir>/.bootstrap_token` holds
//! a one-time token. Quick setup consumes it exactly once.

pub mod bootstrap;
pub mod bypass;
pub mod cookies;
pub mod csrf;
pub(crate) mod engine;
pub mod gate;
pub mod lockout;
pub mod login;
pub mod network;
pub mod oidc;
pub mod password;
pub mod principal;
pub mod rate_limit;
pub mod sessions;
mod state;
pub mod tokens;
pub(crate) mod utils;

pub use csrf::check_csrf;
pub use engine::auth_context;
pub use gate::{PermissionGate, require_admin, require_auth, require_permission, require_scope};
pub use principal::{AuthContext, AuthMethod, Principal};
pub use rate_limit::{NoopRateLimiter, QuotaRateLimiter};
pub use state::{
    AuthConfig, AuthState, AuthStores, MAINTENANCE_INTERVAL, ProxyAuthConfig, spawn_maintenance,
};
