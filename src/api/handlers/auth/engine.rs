//! Request authentication.
//!
//! Flow Overview:
//! 1) Dev bypass, evaluated once per process.
//! 2) Proxy auth via `X-Proxy-Secret` and the configured user/role headers.
//! 3) OIDC session cookie; schedules a background token refresh when needed.
//! 4) No auth configured at all: anonymous access.
//! 5) API-only mode: a valid API token is mandatory.
//! 6) API tokens (`X-API-Token`, `Authorization: Bearer`, `?token=` on WebSocket upgrades).
//! 7) Session cookie with sliding expiration.
//! 8) Basic auth for the configured local user (rate limit, lockout, argon2).
//! 9) Deny.
//!
//! [`auth_context`] walks the same tree without enforcing anything and without
//! password checks; it only records who is calling. The gates call
//! [`check_auth`] and reject on failure.

use axum::{
    Json,
    extract::{Request, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{ACCEPT, AUTHORIZATION, SET_COOKIE, UPGRADE, USER_AGENT},
        request::Parts,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{Duration, Utc};
use secrecy::ExposeSecret;
use serde_json::json;
use std::{net::IpAddr, sync::Arc};
use tracing::{debug, error, info, warn};

use super::{
    cookies::{self, COOKIE_MAX_AGE_SECONDS, SESSION_COOKIE},
    network::{PeerInfo, peer_info},
    oidc::needs_refresh,
    principal::{AuthContext, AuthMethod, Principal},
    rate_limit::{RateLimitAction, RateLimitDecision},
    sessions::NewSession,
    state::AuthState,
    utils::{constant_time_eq, generate_token, safe_prefix},
};
use crate::api::handlers::{audit::AuditEvent, tenant::OrgContext};

pub const X_AUTHENTICATED_USER: HeaderName = HeaderName::from_static("x-authenticated-user");
pub const X_AUTH_METHOD: HeaderName = HeaderName::from_static("x-auth-method");
pub const X_API_TOKEN: &str = "x-api-token";
pub const X_PROXY_SECRET: &str = "x-proxy-secret";
pub const LOGIN_PATH: &str = "/api/login";

/// Borrowed view of the request parts the engine looks at.
pub(crate) struct RequestFacts<'a> {
    pub(crate) headers: &'a HeaderMap,
    pub(crate) path: &'a str,
    query: Option<&'a str>,
    pub(crate) peer: Option<PeerInfo>,
    pub(crate) org_id: String,
}

impl<'a> RequestFacts<'a> {
    pub(crate) fn new(parts: &'a Parts) -> Self {
        Self {
            headers: &parts.headers,
            path: parts.uri.path(),
            query: parts.uri.query(),
            peer: peer_info(&parts.extensions),
            org_id: parts
                .extensions
                .get::<OrgContext>()
                .map_or_else(|| OrgContext::default().org_id, |org| org.org_id.clone()),
        }
    }

    fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn is_websocket(&self) -> bool {
        self.header(UPGRADE.as_str())
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
    }

    fn query_token(&self) -> Option<String> {
        url::form_urlencoded::parse(self.query?.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn bearer_token(&self) -> Option<&'a str> {
        let value = self.header(AUTHORIZATION.as_str())?;
        let (scheme, rest) = value.split_once(' ')?;
        scheme
            .eq_ignore_ascii_case("bearer")
            .then(|| rest.trim())
            .filter(|token| !token.is_empty())
    }

    pub(crate) fn basic_credentials(&self) -> Option<(String, String)> {
        let value = self.header(AUTHORIZATION.as_str())?;
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }

    pub(crate) fn session_cookie(&self) -> Option<String> {
        cookies::read_cookie(self.headers, SESSION_COOKIE)
    }

    fn wants_json(&self) -> bool {
        self.path.starts_with("/api/")
            || self
                .header(ACCEPT.as_str())
                .is_some_and(|accept| accept.contains("application/json"))
    }
}

/// Successful authentication: the context plus headers for the response.
#[derive(Debug)]
pub(crate) struct Granted {
    pub(crate) ctx: AuthContext,
    pub(crate) headers: HeaderMap,
}

impl Granted {
    fn new(ctx: AuthContext) -> Self {
        let mut headers = HeaderMap::new();
        let name = ctx.principal.name();
        if !name.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&name) {
                headers.insert(X_AUTHENTICATED_USER, value);
            }
        }
        if let Some(method) = ctx.method {
            headers.insert(X_AUTH_METHOD, HeaderValue::from_static(method.as_str()));
        }
        Self { ctx, headers }
    }

    /// Copy the auth headers onto a response; cookies are appended.
    pub(crate) fn apply(&self, response: &mut Response) {
        apply_headers(&self.headers, response);
    }
}

pub(crate) fn apply_headers(headers: &HeaderMap, response: &mut Response) {
    let target = response.headers_mut();
    for (name, value) in headers {
        if name == SET_COOKIE {
            target.append(name.clone(), value.clone());
        } else {
            target.insert(name.clone(), value.clone());
        }
    }
}

fn context(
    facts: &RequestFacts<'_>,
    client_ip: Option<IpAddr>,
    principal: Principal,
    method: AuthMethod,
) -> AuthContext {
    AuthContext {
        principal,
        method: Some(method),
        client_ip,
        peer: facts.peer,
        session_org: None,
    }
}

/// JSON for API clients, plain text otherwise.
pub(crate) fn error_response(
    facts: &RequestFacts<'_>,
    status: StatusCode,
    body: serde_json::Value,
    text: &'static str,
) -> Response {
    if facts.wants_json() {
        (status, Json(body)).into_response()
    } else {
        (status, text).into_response()
    }
}

pub(crate) fn unauthorized(facts: &RequestFacts<'_>) -> Response {
    error_response(
        facts,
        StatusCode::UNAUTHORIZED,
        json!({"error": "Authentication required"}),
        "Unauthorized",
    )
}

fn internal_error(facts: &RequestFacts<'_>) -> Response {
    error_response(
        facts,
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": "internal_error", "message": "Internal server error"}),
        "Internal Server Error",
    )
}

enum ProxyOutcome {
    NotApplicable,
    Rejected,
    Authenticated { name: String, admin: bool },
}

fn check_proxy(state: &AuthState, facts: &RequestFacts<'_>) -> ProxyOutcome {
    let Some(proxy) = state.config().proxy() else {
        return ProxyOutcome::NotApplicable;
    };
    let provided = facts.header(X_PROXY_SECRET).unwrap_or_default();
    if !constant_time_eq(provided, proxy.secret().expose_secret()) {
        debug!(provided_secret_length = provided.len(), "Invalid proxy secret");
        return ProxyOutcome::NotApplicable;
    }
    let name = match proxy.user_header() {
        Some(header) => match facts.header(header) {
            Some(user) => user.to_string(),
            None => {
                debug!(header, "Proxy auth user header not found");
                return ProxyOutcome::Rejected;
            }
        },
        None => String::new(),
    };
    let admin = match proxy.role_header().and_then(|header| facts.header(header)) {
        Some(roles) => roles
            .split(proxy.role_separator())
            .any(|role| role.trim() == proxy.admin_role()),
        None => true,
    };
    debug!(user = %name, is_admin = admin, "Proxy authentication successful");
    ProxyOutcome::Authenticated { name, admin }
}

fn proxy_context(
    state: &AuthState,
    facts: &RequestFacts<'_>,
    client_ip: Option<IpAddr>,
) -> Option<Result<AuthContext, ()>> {
    match check_proxy(state, facts) {
        ProxyOutcome::NotApplicable => None,
        ProxyOutcome::Rejected => Some(Err(())),
        ProxyOutcome::Authenticated { name, admin } => Some(Ok(context(
            facts,
            client_ip,
            Principal::ProxyUser { name, admin },
            AuthMethod::Proxy,
        ))),
    }
}

fn oidc_context(
    state: &AuthState,
    facts: &RequestFacts<'_>,
    client_ip: Option<IpAddr>,
    schedule_refresh: bool,
) -> Option<AuthContext> {
    if !state.config().oidc_enabled() {
        return None;
    }
    let token = facts.session_cookie()?;
    let record = state.sessions().get(&token)?;
    if !record.is_oidc() || record.username.is_empty() {
        return None;
    }
    if schedule_refresh && needs_refresh(&record, Utc::now()) {
        if let Some(refresher) = state.oidc() {
            let username = record.username.clone();
            if refresher.schedule(state.refresh_targets(), token, record.clone()) {
                debug!(user = %username, "Scheduled OIDC token refresh");
            }
        }
    }
    let mut ctx = context(
        facts,
        client_ip,
        Principal::OidcUser {
            name: record.username,
        },
        AuthMethod::Oidc,
    );
    ctx.session_org = record.org_id;
    Some(ctx)
}

fn token_context(
    state: &AuthState,
    facts: &RequestFacts<'_>,
    client_ip: Option<IpAddr>,
    allow_query: bool,
) -> Option<AuthContext> {
    if !state.tokens().has_tokens() {
        return None;
    }
    let candidates = [
        facts.header(X_API_TOKEN).map(ToString::to_string),
        facts.bearer_token().map(ToString::to_string),
        allow_query.then(|| facts.query_token()).flatten(),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|raw| state.tokens().validate(&raw))
        .map(|record| {
            context(
                facts,
                client_ip,
                Principal::Token(Box::new(record)),
                AuthMethod::ApiToken,
            )
        })
}

fn session_context(
    state: &AuthState,
    facts: &RequestFacts<'_>,
    client_ip: Option<IpAddr>,
    extend: bool,
) -> Option<AuthContext> {
    let token = facts.session_cookie()?;
    let record = if extend {
        state.sessions().validate_and_extend(&token)
    } else {
        state.sessions().get(&token)
    };
    let Some(record) = record else {
        debug!(
            session_token = %safe_prefix(&token, 8),
            path = facts.path,
            "Session validation failed - token not found or expired"
        );
        return None;
    };
    let principal = if record.is_oidc() {
        Principal::OidcUser {
            name: record.username.clone(),
        }
    } else {
        Principal::LocalUser {
            name: record.username.clone(),
        }
    };
    let mut ctx = context(facts, client_ip, principal, AuthMethod::Session);
    ctx.session_org = record.org_id;
    Some(ctx)
}

fn bypass_context(facts: &RequestFacts<'_>, client_ip: Option<IpAddr>) -> AuthContext {
    context(
        facts,
        client_ip,
        Principal::LocalUser {
            name: "admin".to_string(),
        },
        AuthMethod::Bypass,
    )
}

/// Non-enforcing resolution used by [`auth_context`].
pub(crate) fn resolve_context(state: &AuthState, facts: &RequestFacts<'_>) -> AuthContext {
    let client_ip = state.client_ip(facts.headers, facts.peer);
    if state.admin_bypass() {
        return bypass_context(facts, client_ip);
    }
    if let Some(Ok(ctx)) = proxy_context(state, facts, client_ip) {
        return ctx;
    }
    if let Some(ctx) = oidc_context(state, facts, client_ip, false) {
        return ctx;
    }
    if let Some(ctx) = token_context(state, facts, client_ip, true) {
        return ctx;
    }
    if let Some(ctx) = session_context(state, facts, client_ip, false) {
        return ctx;
    }
    AuthContext::unauthenticated(client_ip, facts.peer)
}

/// Populate [`AuthContext`] for every request without enforcing anything.
pub async fn auth_context(
    State(state): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let ctx = resolve_context(&state, &RequestFacts::new(&parts));
    parts.extensions.insert(ctx);
    request = Request::from_parts(parts, body);
    next.run(request).await
}

/// Enforcing decision. On success the caller must attach `Granted.headers`
/// to the response.
pub(crate) async fn check_auth(
    state: &AuthState,
    facts: &RequestFacts<'_>,
) -> Result<Granted, Response> {
    let client_ip = state.client_ip(facts.headers, facts.peer);
    if state.admin_bypass() {
        return Ok(Granted::new(bypass_context(facts, client_ip)));
    }

    match proxy_context(state, facts, client_ip) {
        Some(Ok(ctx)) => return Ok(Granted::new(ctx)),
        Some(Err(())) => return Err(unauthorized(facts)),
        None => {}
    }

    if let Some(ctx) = oidc_context(state, facts, client_ip, true) {
        return Ok(Granted::new(ctx));
    }

    let local_configured = state.credentials().is_configured();
    let has_tokens = state.tokens().has_tokens();
    if !local_configured && !has_tokens && state.config().proxy().is_none() {
        if state.config().oidc_enabled() {
            debug!("OIDC enabled without local credentials, authentication required");
        } else {
            debug!("No auth configured, allowing access as 'anonymous'");
            let ctx = context(facts, client_ip, Principal::Anonymous, AuthMethod::None);
            return Ok(Granted::new(ctx));
        }
    }

    if !local_configured && has_tokens {
        return api_only(state, facts, client_ip);
    }

    if let Some(ctx) = token_context(state, facts, client_ip, facts.is_websocket()) {
        return Ok(Granted::new(ctx));
    }

    if let Some(ctx) = session_context(state, facts, client_ip, true) {
        return Ok(Granted::new(ctx));
    }

    if local_configured {
        if let Some((user, pass)) = facts.basic_credentials() {
            let ttl = state.config().session_ttl();
            let headers = password_login(state, facts, &user, &pass, ttl).await?;
            let mut granted = Granted::new(context(
                facts,
                client_ip,
                Principal::LocalUser { name: user },
                AuthMethod::Basic,
            ));
            granted.headers.extend(headers);
            return Ok(granted);
        }
    }

    Err(unauthorized(facts))
}

fn api_only(
    state: &AuthState,
    facts: &RequestFacts<'_>,
    client_ip: Option<IpAddr>,
) -> Result<Granted, Response> {
    if let Some(ctx) = token_context(state, facts, client_ip, facts.is_websocket()) {
        return Ok(Granted::new(ctx));
    }
    let presented = facts.header(X_API_TOKEN).is_some()
        || facts.bearer_token().is_some()
        || (facts.is_websocket() && facts.query_token().is_some());
    if presented {
        return Err(error_response(
            facts,
            StatusCode::UNAUTHORIZED,
            json!({"error": "Invalid API token"}),
            "Invalid API token",
        ));
    }
    Err(error_response(
        facts,
        StatusCode::UNAUTHORIZED,
        json!({"error": "API token required via Authorization header or X-API-Token header"}),
        "API token required via Authorization header or X-API-Token header",
    ))
}

/// Verify local credentials and establish a session.
///
/// On `/api/login` this applies the login rate limit and returns the detailed
/// failure bodies; elsewhere a failure is a plain authentication error.
pub(crate) async fn password_login(
    state: &AuthState,
    facts: &RequestFacts<'_>,
    username: &str,
    password: &str,
    ttl: Duration,
) -> Result<HeaderMap, Response> {
    let client_ip = state
        .client_ip(facts.headers, facts.peer)
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let is_login = facts.path == LOGIN_PATH;
    let audit = |success: bool, details: &str| {
        state.audit().log_for_tenant(
            &facts.org_id,
            AuditEvent::new("login")
                .user(username)
                .ip(&client_ip)
                .path(facts.path)
                .success(success)
                .details(details),
        );
    };

    if is_login
        && state.rate_limiter().check(&client_ip, RateLimitAction::Login) == RateLimitDecision::Limited
    {
        warn!(target: "security", ip = %client_ip, "Rate limit exceeded for auth");
        audit(false, "Rate limited");
        return Err(error_response(
            facts,
            StatusCode::TOO_MANY_REQUESTS,
            json!({"error": "Too many authentication attempts"}),
            "Too many authentication attempts",
        ));
    }

    let lockout = state.lockout();
    let user_lock = lockout.lockout(username);
    let ip_lock = lockout.lockout(&client_ip);
    if user_lock.is_locked || ip_lock.is_locked {
        let locked_until = [user_lock, ip_lock]
            .iter()
            .filter(|info| info.is_locked)
            .filter_map(|info| info.locked_until)
            .max()
            .unwrap_or_else(Utc::now);
        let minutes = (locked_until - Utc::now()).num_minutes().max(1);
        warn!(target: "security", user = username, ip = %client_ip, "Account locked out");
        audit(false, "Account locked");
        return Err(error_response(
            facts,
            StatusCode::FORBIDDEN,
            json!({
                "error": "Account temporarily locked",
                "message": format!("Too many failed attempts. Please try again in {minutes} minutes."),
                "lockedUntil": locked_until.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            }),
            "Account temporarily locked",
        ));
    }

    let Some(credentials) = state.credentials().get() else {
        return Err(unauthorized(facts));
    };
    let (user, pass) = (username.to_string(), password.to_string());
    let verified = tokio::task::spawn_blocking(move || credentials.verify(&user, &pass))
        .await
        .unwrap_or_else(|err| {
            error!("Password verification task failed: {err}");
            false
        });

    if !verified {
        let user_info = lockout.record_failure(username);
        let ip_info = lockout.record_failure(&client_ip);
        audit(false, "Invalid credentials");
        warn!(target: "security", user = username, ip = %client_ip, "Invalid credentials");
        if !is_login {
            return Err(unauthorized(facts));
        }
        let attempts = user_info.attempts.max(ip_info.attempts);
        let max = lockout.max_attempts();
        let remaining = max.saturating_sub(attempts);
        let body = if remaining > 0 {
            json!({
                "error": "Invalid credentials",
                "attempts": attempts,
                "remaining": remaining,
                "maxAttempts": max,
            })
        } else {
            json!({
                "error": "Invalid credentials",
                "locked": true,
                "message": format!("Account locked for {} minutes", lockout.lockout_minutes()),
            })
        };
        return Err((StatusCode::UNAUTHORIZED, Json(body)).into_response());
    }

    lockout.clear(username);
    lockout.clear(&client_ip);
    let headers = establish_session(state, facts, username, ttl)?;
    audit(true, "Basic auth login");
    info!(user = username, ip = %client_ip, "Login successful");
    Ok(headers)
}

/// Create a session for `username` and return its `Set-Cookie` headers.
///
/// Any session cookie already on the request is invalidated first.
pub(crate) fn establish_session(
    state: &AuthState,
    facts: &RequestFacts<'_>,
    username: &str,
    ttl: Duration,
) -> Result<HeaderMap, Response> {
    if let Some(previous) = facts.session_cookie() {
        match state.sessions().delete(&previous) {
            Ok(Some(old)) => {
                state.sessions().untrack_user_session(&old.username, &previous);
                debug!(session = %safe_prefix(&previous, 8), "Invalidated pre-login session");
            }
            Ok(None) => {}
            Err(err) => warn!("Failed to invalidate pre-login session: {err}"),
        }
        state.csrf().delete(&previous);
    }

    let token = generate_token().map_err(|err| {
        error!("Failed to generate session token: {err}");
        internal_error(facts)
    })?;
    let client_ip = state
        .client_ip(facts.headers, facts.peer)
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let user_agent = facts.header(USER_AGENT.as_str()).unwrap_or_default();
    let org_id = (facts.org_id != OrgContext::default().org_id).then_some(facts.org_id.as_str());
    state
        .sessions()
        .create(
            &token,
            &NewSession {
                username,
                ttl,
                user_agent,
                client_ip: &client_ip,
                org_id,
            },
        )
        .map_err(|err| {
            error!("Failed to persist session: {err}");
            internal_error(facts)
        })?;
    if let Err(err) = state.track_session(username, &token) {
        warn!(user = username, "Failed to evict sessions over the cap: {err}");
    }
    let csrf = match state.csrf().generate(&token) {
        Ok(csrf) => csrf,
        Err(err) => {
            error!("Failed to persist CSRF token: {err}");
            if let Err(err) = state.sessions().delete(&token) {
                warn!("Failed to roll back session: {err}");
            }
            state.sessions().untrack_user_session(username, &token);
            return Err(internal_error(facts));
        }
    };

    let settings = state.cookie_settings(facts.headers, facts.peer);
    let max_age = ttl.num_seconds().max(COOKIE_MAX_AGE_SECONDS);
    debug!(
        secure = settings.secure,
        same_site = settings.same_site.as_str(),
        token = %safe_prefix(&token, 8),
        "Setting session cookie after successful login"
    );
    let mut headers = HeaderMap::new();
    let session_cookie = cookies::session_cookie(&token, settings, max_age);
    let csrf_cookie = cookies::csrf_cookie(&csrf, settings, max_age);
    match (session_cookie, csrf_cookie) {
        (Ok(session_cookie), Ok(csrf_cookie)) => {
            headers.append(SET_COOKIE, session_cookie);
            headers.append(SET_COOKIE, csrf_cookie);
            Ok(headers)
        }
        _ => Err(internal_error(facts)),
    }
}
