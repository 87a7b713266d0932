//! Route gates.
//!
//! Gates are attached with `route_layer` so that unmatched methods still get
//! a 405 before any auth runs.

use axum::{
    Json,
    extract::{Request, State},
    http::{StatusCode, header::USER_AGENT},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

use super::{
    engine::{Granted, RequestFacts, check_auth},
    principal::AuthContext,
    state::AuthState,
};
use crate::api::handlers::tenant::{OrgContext, rbac::Authorizer};

async fn enforce(
    state: &AuthState,
    request: Request,
    admin_only: bool,
) -> Result<(Request, Granted), Response> {
    let (mut parts, body) = request.into_parts();
    let facts = RequestFacts::new(&parts);
    let outcome = check_auth(state, &facts).await;
    let granted = match outcome {
        Ok(granted) => granted,
        Err(response) => {
            let user_agent = facts
                .headers
                .get(USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            warn!(
                target: "security",
                ip = %state.client_ip(facts.headers, facts.peer).map(|ip| ip.to_string()).unwrap_or_default(),
                path = facts.path,
                user_agent,
                "Unauthorized access attempt"
            );
            return Err(response);
        }
    };
    if admin_only && !granted.ctx.principal.is_admin_capable() {
        warn!(
            target: "security",
            user = %granted.ctx.principal.name(),
            path = facts.path,
            "Non-admin user attempted to access admin endpoint"
        );
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "admin_privileges_required",
                "message": "Admin privileges required",
            })),
        )
            .into_response());
    }
    parts.extensions.insert(granted.ctx.clone());
    Ok((Request::from_parts(parts, body), granted))
}

/// Reject unauthenticated requests.
pub async fn require_auth(
    State(state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    match enforce(&state, request, false).await {
        Ok((request, granted)) => {
            let mut response = next.run(request).await;
            granted.apply(&mut response);
            response
        }
        Err(response) => response,
    }
}

/// Reject unauthenticated requests and proxy users without the admin role.
pub async fn require_admin(
    State(state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    match enforce(&state, request, true).await {
        Ok((request, granted)) => {
            let mut response = next.run(request).await;
            granted.apply(&mut response);
            response
        }
        Err(response) => response,
    }
}

/// State for [`require_permission`].
#[derive(Clone)]
pub struct PermissionGate {
    action: &'static str,
    resource: &'static str,
    authorizer: Arc<dyn Authorizer>,
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("action", &self.action)
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl PermissionGate {
    #[must_use]
    pub fn new(action: &'static str, resource: &'static str, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            action,
            resource,
            authorizer,
        }
    }
}

/// Ask the authorizer whether the resolved principal may act on a resource.
///
/// Runs behind [`require_auth`] or [`require_admin`], which store the context.
pub async fn require_permission(
    State(gate): State<PermissionGate>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ctx) = request
        .extensions()
        .get::<AuthContext>()
        .filter(|ctx| ctx.is_authenticated())
        .cloned()
    else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "authentication_required",
                "message": "Authentication required",
            })),
        )
            .into_response();
    };
    let org_id = request
        .extensions()
        .get::<OrgContext>()
        .cloned()
        .unwrap_or_default()
        .org_id;

    match gate
        .authorizer
        .authorize(&ctx, &org_id, gate.action, gate.resource)
    {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            warn!(
                target: "security",
                user = %ctx.principal.name(),
                org_id,
                action = gate.action,
                resource = gate.resource,
                "Permission denied"
            );
            (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "forbidden",
                    "message": "You do not have permission to perform this action",
                    "action": gate.action,
                    "resource": gate.resource,
                })),
            )
                .into_response()
        }
        Err(err) => {
            error!(org_id, "Authorization check failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "internal_error",
                    "message": "Failed to verify permissions",
                })),
            )
                .into_response()
        }
    }
}

/// Require a scope on API-token principals. Other principals pass.
pub async fn require_scope(
    State(scope): State<&'static str>,
    request: Request,
    next: Next,
) -> Response {
    if scope.is_empty() {
        return next.run(request).await;
    }
    let missing = request
        .extensions()
        .get::<AuthContext>()
        .and_then(AuthContext::api_token)
        .is_some_and(|record| !record.has_scope(scope));
    if missing {
        warn!(target: "security", scope, "API token missing required scope");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "missing_scope",
                "requiredScope": scope,
            })),
        )
            .into_response();
    }
    next.run(request).await
}
