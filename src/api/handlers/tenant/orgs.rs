//! Organizations and membership checks.

use axum::{
    Extension, Json,
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

use super::{DEFAULT_ORG_ID, MultiTenantPersistence, TenantError, is_valid_org_id};
use crate::api::handlers::{
    auth::AuthContext,
    persist::{load_json, save_json},
};

pub const ORG_FILE: &str = "org.json";
pub const BILLING_FILE: &str = "billing.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgMember {
    pub user_id: String,
    pub role: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub owner_user_id: String,
    #[serde(default)]
    pub members: Vec<OrgMember>,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    #[must_use]
    pub fn new(id: &str, display_name: &str, owner: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            owner_user_id: owner.to_string(),
            members: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_member(mut self, user_id: &str, role: &str) -> Self {
        self.members.push(OrgMember {
            user_id: user_id.to_string(),
            role: role.to_string(),
            added_at: Utc::now(),
        });
        self
    }

    #[must_use]
    pub fn is_member(&self, user_id: &str) -> bool {
        self.owner_user_id == user_id || self.members.iter().any(|m| m.user_id == user_id)
    }

    fn default_org() -> Self {
        Self {
            id: DEFAULT_ORG_ID.to_string(),
            display_name: "Default Organization".to_string(),
            owner_user_id: String::new(),
            members: Vec::new(),
            created_at: DateTime::<Utc>::default(),
        }
    }
}

/// Read `org.json`. The default org is synthesized when it has none.
///
/// # Errors
/// Returns an error for invalid IDs or unreadable files.
pub fn load_org(
    persistence: &MultiTenantPersistence,
    org_id: &str,
) -> Result<Option<Organization>, TenantError> {
    let path = persistence.org_dir(org_id)?.join(ORG_FILE);
    match load_json::<Organization>(&path)? {
        Some(org) => Ok(Some(org)),
        None if org_id == DEFAULT_ORG_ID => Ok(Some(Organization::default_org())),
        None => Ok(None),
    }
}

/// # Errors
/// Returns an error for invalid IDs or when the file cannot be written.
pub fn save_org(persistence: &MultiTenantPersistence, org: &Organization) -> Result<(), TenantError> {
    let dir = persistence.create_org_dir(&org.id)?;
    save_json(&dir.join(ORG_FILE), org)?;
    Ok(())
}

/// Whether the caller may see `org_id`.
///
/// Tokens follow their org binding. Users need a name; the default org is open
/// to every user, other orgs only to their owner and members.
#[must_use]
pub fn can_access_org(ctx: &AuthContext, org_id: &str, org: Option<&Organization>) -> bool {
    if let Some(record) = ctx.api_token() {
        return record.can_access_org(org_id);
    }
    let Some(user) = ctx.principal.username().filter(|user| !user.is_empty()) else {
        return false;
    };
    if org_id == DEFAULT_ORG_ID {
        return true;
    }
    org.is_some_and(|org| org.is_member(user))
}

fn org_error(status: StatusCode, error: &'static str, message: &str) -> Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}

fn authorized_org(
    persistence: &MultiTenantPersistence,
    ctx: &AuthContext,
    org_id: &str,
) -> Result<Organization, Response> {
    if !is_valid_org_id(org_id) {
        return Err(org_error(
            StatusCode::BAD_REQUEST,
            "invalid_org",
            "Invalid organization ID",
        ));
    }
    let org = load_org(persistence, org_id).map_err(|err| {
        error!(org_id, "Failed to load organization: {err}");
        org_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Failed to load organization",
        )
    })?;
    let Some(org) = org else {
        return Err(org_error(
            StatusCode::NOT_FOUND,
            "org_not_found",
            "Organization not found",
        ));
    };
    if !can_access_org(ctx, org_id, Some(&org)) {
        warn!(
            target: "security",
            user = %ctx.principal.name(),
            org_id,
            "Organization access denied"
        );
        return Err(org_error(
            StatusCode::FORBIDDEN,
            "org_access_denied",
            "You do not have access to this organization",
        ));
    }
    Ok(org)
}

/// `GET /api/orgs/{id}`
pub async fn get_org(
    Extension(persistence): Extension<Arc<MultiTenantPersistence>>,
    Extension(ctx): Extension<AuthContext>,
    Path(org_id): Path<String>,
) -> Response {
    match authorized_org(&persistence, &ctx, &org_id) {
        Ok(org) => Json(org).into_response(),
        Err(response) => response,
    }
}

/// `GET /api/admin/orgs/{id}/billing-state`
pub async fn billing_state(
    Extension(persistence): Extension<Arc<MultiTenantPersistence>>,
    Extension(ctx): Extension<AuthContext>,
    Path(org_id): Path<String>,
) -> Response {
    if let Err(response) = authorized_org(&persistence, &ctx, &org_id) {
        return response;
    }
    let path = match persistence.org_dir(&org_id) {
        Ok(dir) => dir.join(BILLING_FILE),
        Err(_) => {
            return org_error(
                StatusCode::BAD_REQUEST,
                "invalid_org",
                "Invalid organization ID",
            );
        }
    };
    match load_json::<serde_json::Value>(&path) {
        Ok(state) => Json(state.unwrap_or_else(|| json!({"state": "none"}))).into_response(),
        Err(err) => {
            error!(org_id, "Failed to read billing state: {err}");
            org_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Failed to read billing state",
            )
        }
    }
}
