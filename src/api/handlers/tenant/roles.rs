//! `/api/admin/roles` and user role assignment.

use axum::{
    Extension, Json,
    body::Bytes,
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use super::{
    OrgContext,
    rbac::{RbacError, RbacManager, RoleInput, TenantRbacProvider},
};
use crate::api::handlers::{
    audit::AuditEvent,
    auth::{AuthContext, AuthState},
};

impl IntoResponse for RbacError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            Self::BuiltinImmutable(_) => (StatusCode::BAD_REQUEST, "builtin_role"),
            Self::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid_role"),
            Self::Cycle(_) | Self::TooDeep => (StatusCode::BAD_REQUEST, "invalid_inheritance"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Tenant(_) | Self::Store(_) => {
                error!("RBAC operation failed: {self}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal_error", "message": "RBAC operation failed"})),
                )
                    .into_response();
            }
        };
        (status, Json(json!({"error": error, "message": self.to_string()}))).into_response()
    }
}

fn manager(provider: &TenantRbacProvider, org: &OrgContext) -> Result<Arc<RbacManager>, Response> {
    provider
        .get_manager(&org.org_id)
        .map_err(IntoResponse::into_response)
}

fn parse<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_request", "message": "Invalid request body"})),
        )
            .into_response()
    })
}

fn audit(state: &AuthState, ctx: &AuthContext, org: &OrgContext, event: &str, details: String) {
    state.audit().log_for_tenant(
        &org.org_id,
        AuditEvent::new(event)
            .user(&ctx.principal.name())
            .ip(&ctx.client_ip_string())
            .success(true)
            .details(&details),
    );
}

/// `GET /api/admin/roles`
pub async fn list_roles(
    Extension(provider): Extension<Arc<TenantRbacProvider>>,
    Extension(org): Extension<OrgContext>,
) -> Response {
    match manager(&provider, &org) {
        Ok(manager) => Json(manager.roles()).into_response(),
        Err(response) => response,
    }
}

/// `GET /api/admin/roles/{id}`
pub async fn get_role(
    Extension(provider): Extension<Arc<TenantRbacProvider>>,
    Extension(org): Extension<OrgContext>,
    Path(id): Path<String>,
) -> Response {
    let manager = match manager(&provider, &org) {
        Ok(manager) => manager,
        Err(response) => return response,
    };
    match manager.role(&id) {
        Some(role) => Json(role).into_response(),
        None => RbacError::NotFound(id).into_response(),
    }
}

/// `POST /api/admin/roles`
pub async fn create_role(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(provider): Extension<Arc<TenantRbacProvider>>,
    Extension(org): Extension<OrgContext>,
    Extension(ctx): Extension<AuthContext>,
    body: Bytes,
) -> Response {
    let input: RoleInput = match parse(&body) {
        Ok(input) => input,
        Err(response) => return response,
    };
    save(&state, &provider, &org, &ctx, input)
}

/// `PUT /api/admin/roles/{id}`; the path ID wins over the body.
pub async fn update_role(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(provider): Extension<Arc<TenantRbacProvider>>,
    Extension(org): Extension<OrgContext>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let input: RoleInput = match parse(&body) {
        Ok(input) => input,
        Err(response) => return response,
    };
    let manager = match manager(&provider, &org) {
        Ok(manager) => manager,
        Err(response) => return response,
    };
    if manager.role(&id).is_none() {
        return RbacError::NotFound(id).into_response();
    }
    save(&state, &provider, &org, &ctx, RoleInput { id, ..input })
}

fn save(
    state: &AuthState,
    provider: &TenantRbacProvider,
    org: &OrgContext,
    ctx: &AuthContext,
    input: RoleInput,
) -> Response {
    let manager = match manager(provider, org) {
        Ok(manager) => manager,
        Err(response) => return response,
    };
    match manager.save_role(input) {
        Ok(role) => {
            audit(state, ctx, org, "role_saved", format!("Role saved: {}", role.id));
            Json(role).into_response()
        }
        Err(err) => err.into_response(),
    }
}

/// `DELETE /api/admin/roles/{id}`
pub async fn delete_role(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(provider): Extension<Arc<TenantRbacProvider>>,
    Extension(org): Extension<OrgContext>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    let manager = match manager(&provider, &org) {
        Ok(manager) => manager,
        Err(response) => return response,
    };
    match manager.delete_role(&id) {
        Ok(()) => {
            audit(&state, &ctx, &org, "role_deleted", format!("Role deleted: {id}"));
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    #[serde(default)]
    pub role_ids: Vec<String>,
}

/// `PUT /api/admin/users/{username}/roles`
pub async fn assign_user_roles(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(provider): Extension<Arc<TenantRbacProvider>>,
    Extension(org): Extension<OrgContext>,
    Extension(ctx): Extension<AuthContext>,
    Path(username): Path<String>,
    body: Bytes,
) -> Response {
    let request: RoleAssignment = match parse(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let manager = match manager(&provider, &org) {
        Ok(manager) => manager,
        Err(response) => return response,
    };
    match manager.assign_roles(&username, &request.role_ids) {
        Ok(role_ids) => {
            audit(
                &state,
                &ctx,
                &org,
                "roles_assigned",
                format!("Roles for {username}: {}", role_ids.join(",")),
            );
            Json(json!({"username": username, "roleIds": role_ids})).into_response()
        }
        Err(err) => err.into_response(),
    }
}
