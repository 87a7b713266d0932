//! Login, logout, lockout reset and first-boot quick setup.

use axum::{
    Extension, Json,
    body::Bytes,
    http::{StatusCode, header::SET_COOKIE, request::Parts},
    response::{IntoResponse, Response},
};
use chrono::Duration;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{
    bootstrap::provided_token,
    cookies,
    engine::{RequestFacts, apply_headers, establish_session, password_login},
    password::{hash_password_blocking, validate_complexity},
    principal::AuthContext,
    rate_limit::{RateLimitAction, RateLimitDecision},
    state::AuthState,
    tokens::{ApiTokenRecord, SCOPE_WILDCARD},
};
use crate::api::handlers::audit::AuditEvent;

pub const REMEMBER_ME_DAYS: i64 = 30;

fn bad_request(code: &'static str, message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": code, "message": message})),
    )
        .into_response()
}

fn internal(code: &'static str, message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": code, "message": message})),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    remember_me: bool,
}

/// `POST /api/login`
///
/// Credentials come from a JSON body or, when the body is empty, from
/// `Authorization: Basic`.
pub async fn login(
    Extension(state): Extension<Arc<AuthState>>,
    parts: Parts,
    body: Bytes,
) -> Response {
    let facts = RequestFacts::new(&parts);
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        match facts.basic_credentials() {
            Some((username, password)) => LoginRequest {
                username,
                password,
                remember_me: false,
            },
            None => return bad_request("invalid_request", "Invalid request body"),
        }
    } else {
        match serde_json::from_slice::<LoginRequest>(&body) {
            Ok(request) => request,
            Err(_) => return bad_request("invalid_request", "Invalid request body"),
        }
    };

    let ttl = if request.remember_me {
        Duration::days(REMEMBER_ME_DAYS)
    } else {
        state.config().session_ttl()
    };
    match password_login(&state, &facts, &request.username, &request.password, ttl).await {
        Ok(headers) => {
            let mut response = Json(json!({
                "success": true,
                "message": "Successfully logged in",
            }))
            .into_response();
            apply_headers(&headers, &mut response);
            response
        }
        Err(response) => response,
    }
}

/// `POST /api/logout`
pub async fn logout(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(ctx): Extension<AuthContext>,
    parts: Parts,
) -> Response {
    let facts = RequestFacts::new(&parts);
    if let Some(token) = facts.session_cookie() {
        match state.sessions().delete(&token) {
            Ok(Some(record)) => state.sessions().untrack_user_session(&record.username, &token),
            Ok(None) => {}
            Err(err) => {
                error!("Failed to delete session on logout: {err}");
                return internal("session_error", "Failed to end session");
            }
        }
        state.csrf().delete(&token);
    }

    let client_ip = ctx.client_ip_string();
    let user = ctx.principal.name();
    state.audit().log_for_tenant(
        &facts.org_id,
        AuditEvent::new("logout")
            .user(&user)
            .ip(&client_ip)
            .path(facts.path)
            .success(true)
            .details("User logged out"),
    );
    info!(user, ip = %client_ip, "User logged out");

    let settings = state.cookie_settings(facts.headers, facts.peer);
    let mut response = Json(json!({
        "success": true,
        "message": "Successfully logged out",
    }))
    .into_response();
    for cleared in [
        cookies::clear_session_cookie(settings),
        cookies::clear_csrf_cookie(settings),
    ]
    .into_iter()
    .flatten()
    {
        response.headers_mut().append(SET_COOKIE, cleared);
    }
    response
}

#[derive(Debug, Default, Deserialize)]
struct ResetLockoutRequest {
    #[serde(default)]
    identifier: String,
}

/// `POST /api/security/reset-lockout`
pub async fn reset_lockout(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(ctx): Extension<AuthContext>,
    parts: Parts,
    body: Bytes,
) -> Response {
    let Ok(request) = serde_json::from_slice::<ResetLockoutRequest>(&body) else {
        return bad_request("invalid_request", "Invalid request body");
    };
    let identifier = request.identifier.trim();
    if identifier.is_empty() {
        return bad_request("missing_identifier", "Identifier (username or IP) is required");
    }
    state.lockout().reset(identifier);

    let facts = RequestFacts::new(&parts);
    let client_ip = ctx.client_ip_string();
    let actor = ctx.principal.name();
    state.audit().log_for_tenant(
        &facts.org_id,
        AuditEvent::new("lockout_reset")
            .user(&actor)
            .ip(&client_ip)
            .path(facts.path)
            .success(true)
            .details(&format!("Lockout reset for: {identifier}")),
    );
    info!(identifier, reset_by = %actor, ip = %client_ip, "Account lockout manually reset");

    Json(json!({
        "success": true,
        "message": format!("Lockout reset for {identifier}"),
    }))
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuickSetupRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    setup_token: Option<String>,
    #[serde(default)]
    api_token: Option<String>,
}

/// `POST /api/security/quick-setup`
///
/// Consumes the bootstrap token, stores local credentials and logs the caller in.
pub async fn quick_setup(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(ctx): Extension<AuthContext>,
    parts: Parts,
    body: Bytes,
) -> Response {
    let facts = RequestFacts::new(&parts);
    let client_ip = ctx.client_ip_string();
    if state.rate_limiter().check(&client_ip, RateLimitAction::Bootstrap) == RateLimitDecision::Limited {
        warn!(target: "security", ip = %client_ip, "Rate limit exceeded for quick setup");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "Too many setup attempts"})),
        )
            .into_response();
    }

    let bootstrap = state.bootstrap();
    if !bootstrap.is_active() {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "setup_complete", "message": "Security is already configured"})),
        )
            .into_response();
    }

    let Ok(request) = serde_json::from_slice::<QuickSetupRequest>(&body) else {
        return bad_request("invalid_request", "Invalid request body");
    };
    let token = provided_token(facts.headers, &[]).or_else(|| {
        request
            .setup_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToString::to_string)
    });
    if !token.is_some_and(|token| bootstrap.validate(&token)) {
        warn!(target: "security", ip = %client_ip, "Quick setup rejected: invalid bootstrap token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid bootstrap setup token"})),
        )
            .into_response();
    }

    let username = request.username.trim();
    if username.is_empty() {
        return bad_request("missing_username", "Username is required");
    }
    if let Err(err) = validate_complexity(&request.password) {
        return bad_request("weak_password", &err.to_string());
    }
    let api_token = request
        .api_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if api_token.is_some_and(|token| token.len() < 16) {
        return bad_request("invalid_api_token", "API token must be at least 16 characters");
    }

    let Some(claim) = bootstrap.claim() else {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "setup_complete", "message": "Security is already configured"})),
        )
            .into_response();
    };

    let hash = match hash_password_blocking(request.password).await {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password during quick setup: {err}");
            return internal("setup_failed", "Failed to store credentials");
        }
    };

    let mut added_token = None;
    if let Some(raw) = api_token {
        if state.tokens().validate(raw).is_none() {
            let record = ApiTokenRecord::new(raw, "quick-setup", &[SCOPE_WILDCARD.to_string()]);
            let id = record.id.clone();
            if let Err(err) = state.tokens().add(record) {
                error!("Failed to store API token during quick setup: {err}");
                return internal("setup_failed", "Failed to store API token");
            }
            added_token = Some(id);
        }
    }

    if let Err(err) = state.credentials().set_hash(username, hash) {
        error!("Failed to store credentials during quick setup: {err}");
        if let Some(id) = added_token {
            if let Err(err) = state.tokens().remove(&id) {
                error!("Failed to roll back quick setup API token: {err}");
            }
        }
        return internal("setup_failed", "Failed to store credentials");
    }
    claim.commit();

    match state.invalidate_user_sessions(username) {
        Ok(0) => {}
        Ok(removed) => info!(user = username, removed, "Invalidated sessions after credential change"),
        Err(err) => warn!(user = username, "Failed to invalidate existing sessions: {err}"),
    }

    state.audit().log_for_tenant(
        &facts.org_id,
        AuditEvent::new("setup")
            .user(username)
            .ip(&client_ip)
            .path(facts.path)
            .success(true)
            .details("Quick security setup completed"),
    );
    info!(user = username, ip = %client_ip, "Quick security setup completed");

    let ttl = state.config().session_ttl();
    match establish_session(&state, &facts, username, ttl) {
        Ok(headers) => {
            let mut response = Json(json!({
                "success": true,
                "message": "Security configured",
            }))
            .into_response();
            apply_headers(&headers, &mut response);
            response
        }
        Err(response) => response,
    }
}
