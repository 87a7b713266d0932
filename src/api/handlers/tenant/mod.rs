//! Organization (tenant) resolution.
//!
//! Every request carries exactly one org ID. The resolver picks it from, in
//! order, `X-Pulse-Org-ID`, the org an API token is bound to, the org claimed by
//! the session, and finally `default`. Tokens must be bound to the resolved org
//! and users must be members of it. Tenant resources (monitor handle, RBAC
//! manager, audit logger) are created lazily per org and cached.

use axum::{
    Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::auth::AuthContext;

pub mod orgs;
pub mod persistence;
pub mod rbac;
pub mod roles;

pub use persistence::{MonitorConfig, MultiTenantPersistence, TenantMonitor, TenantMonitors};

pub const DEFAULT_ORG_ID: &str = "default";
pub const ORG_HEADER: &str = "x-pulse-org-id";

static ORG_ID_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,64}$").ok());

/// Whether `org_id` is safe to use as a directory name.
#[must_use]
pub fn is_valid_org_id(org_id: &str) -> bool {
    if org_id == "." || org_id == ".." {
        return false;
    }
    ORG_ID_RE
        .as_ref()
        .is_some_and(|re| re.is_match(org_id))
}

#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("invalid organization ID: {0}")]
    InvalidOrgId(String),
    #[error("organization not found: {0}")]
    UnknownOrg(String),
    #[error(transparent)]
    Store(#[from] super::persist::StoreError),
}

/// Org resolved for the current request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrgContext {
    pub org_id: String,
}

impl OrgContext {
    #[must_use]
    pub fn new(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
        }
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.org_id == DEFAULT_ORG_ID
    }
}

impl Default for OrgContext {
    fn default() -> Self {
        Self::new(DEFAULT_ORG_ID)
    }
}

fn tenant_error(status: StatusCode, error: &'static str, message: &str) -> Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}

/// Store an [`OrgContext`] in the request extensions.
///
/// Runs after the auth context middleware so token and session claims are
/// available. Anonymous requests pass through; the route gates reject them.
pub async fn resolve_tenant(
    State(persistence): State<Arc<MultiTenantPersistence>>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(ORG_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string);
    let ctx = request.extensions().get::<AuthContext>().cloned();
    let token = ctx.as_ref().and_then(AuthContext::api_token);

    let org_id = header
        .or_else(|| token.and_then(|record| record.bound_org()).map(ToString::to_string))
        .or_else(|| ctx.as_ref().and_then(|ctx| ctx.session_org.clone()))
        .unwrap_or_else(|| DEFAULT_ORG_ID.to_string());

    if !is_valid_org_id(&org_id) {
        return tenant_error(
            StatusCode::BAD_REQUEST,
            "invalid_org",
            "Invalid organization ID",
        );
    }
    if let Some(record) = token {
        if !record.can_access_org(&org_id) {
            warn!(
                target: "security",
                token_id = %record.id,
                org_id,
                "API token used outside its organization"
            );
            return tenant_error(
                StatusCode::FORBIDDEN,
                "org_access_denied",
                "Token is not authorized for this organization",
            );
        }
    }
    if let Some(user) = ctx.as_ref().and_then(|ctx| ctx.principal.username()) {
        if org_id != DEFAULT_ORG_ID {
            match orgs::load_org(&persistence, &org_id) {
                Ok(org) if org.as_ref().is_some_and(|org| org.is_member(user)) => {}
                Ok(_) => {
                    warn!(target: "security", user, org_id, "Organization access denied");
                    return tenant_error(
                        StatusCode::FORBIDDEN,
                        "org_access_denied",
                        "User is not a member of this organization",
                    );
                }
                Err(err) => {
                    error!(org_id, "Failed to load organization: {err}");
                    return tenant_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "org_lookup_failed",
                        "Failed to load organization",
                    );
                }
            }
        }
    }

    debug!(org_id, "Resolved organization");
    request.extensions_mut().insert(OrgContext::new(org_id));
    next.run(request).await
}

/// Attach the tenant monitor handle, failing closed for non-default orgs.
///
/// With multi-tenant disabled the default org runs on the singleton monitor and
/// every other org is rejected with 503.
pub async fn monitor_guard(
    State(monitors): State<Option<Arc<TenantMonitors>>>,
    mut request: Request,
    next: Next,
) -> Response {
    let org = request
        .extensions()
        .get::<OrgContext>()
        .cloned()
        .unwrap_or_default();
    let Some(monitors) = monitors else {
        if org.is_default() {
            return next.run(request).await;
        }
        warn!(org_id = %org.org_id, "Tenant monitor requested without multi-tenant support");
        return tenant_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "tenant_unavailable",
            "Multi-tenant monitoring is not available",
        );
    };
    match monitors.get(&org.org_id) {
        Ok(monitor) => {
            request.extensions_mut().insert(monitor);
            next.run(request).await
        }
        Err(err) => {
            warn!(org_id = %org.org_id, "Tenant monitor unavailable: {err}");
            tenant_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "tenant_unavailable",
                "Tenant monitor is not available",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::{AuthMethod, Principal, tokens::ApiTokenRecord};
    use anyhow::Result;
    use axum::{
        Extension, Router,
        body::Body,
        middleware::from_fn_with_state,
        routing::get,
    };
    use tower::ServiceExt;

    async fn echo_org(Extension(org): Extension<OrgContext>) -> String {
        org.org_id
    }

    fn persistence(dir: &tempfile::TempDir) -> Arc<MultiTenantPersistence> {
        Arc::new(MultiTenantPersistence::new(dir.path(), MonitorConfig::default()))
    }

    fn router(persistence: &Arc<MultiTenantPersistence>, ctx: AuthContext) -> Router {
        Router::new()
            .route("/", get(echo_org))
            .layer(from_fn_with_state(Arc::clone(persistence), resolve_tenant))
            .layer(Extension(ctx))
    }

    fn user_ctx(name: &str) -> AuthContext {
        AuthContext {
            principal: Principal::LocalUser { name: name.to_string() },
            method: Some(AuthMethod::Session),
            ..AuthContext::unauthenticated(None, None)
        }
    }

    fn token_ctx(record: ApiTokenRecord) -> AuthContext {
        AuthContext {
            principal: Principal::Token(Box::new(record)),
            method: Some(AuthMethod::ApiToken),
            ..AuthContext::unauthenticated(None, None)
        }
    }

    async fn call(router: Router, header: Option<&str>) -> Result<(StatusCode, String)> {
        let mut builder = Request::builder().uri("/");
        if let Some(org) = header {
            builder = builder.header(ORG_HEADER, org);
        }
        let response = router.oneshot(builder.body(Body::empty())?).await?;
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024).await?;
        Ok((status, String::from_utf8(body.to_vec())?))
    }

    #[test]
    fn org_id_rules() {
        for ok in ["default", "acme", "a.b-c_d", &"x".repeat(64)] {
            assert!(is_valid_org_id(ok), "{ok}");
        }
        for bad in ["", ".", "..", "a/b", "a b", &"x".repeat(65)] {
            assert!(!is_valid_org_id(bad), "{bad}");
        }
    }

    #[tokio::test]
    async fn resolution_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persistence = persistence(&dir);
        let router = |ctx| router(&persistence, ctx);
        let anonymous = AuthContext::unauthenticated(None, None);
        assert_eq!(call(router(anonymous.clone()), None).await?.1, "default");
        assert_eq!(call(router(anonymous), Some("acme")).await?.1, "acme");

        let session = AuthContext {
            session_org: Some("beta".to_string()),
            ..AuthContext::unauthenticated(None, None)
        };
        assert_eq!(call(router(session.clone()), None).await?.1, "beta");
        assert_eq!(call(router(session), Some("acme")).await?.1, "acme");

        let bound = token_ctx(ApiTokenRecord::new("raw-token-value", "ci", &[]).with_org("acme"));
        assert_eq!(call(router(bound), None).await?.1, "acme");
        Ok(())
    }

    #[tokio::test]
    async fn invalid_or_foreign_org_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persistence = persistence(&dir);
        let router = |ctx| router(&persistence, ctx);
        let anonymous = AuthContext::unauthenticated(None, None);
        assert_eq!(
            call(router(anonymous), Some("../etc")).await?.0,
            StatusCode::BAD_REQUEST
        );

        let bound = token_ctx(ApiTokenRecord::new("raw-token-value", "ci", &[]).with_org("acme"));
        assert_eq!(
            call(router(bound), Some("beta")).await?.0,
            StatusCode::FORBIDDEN
        );
        Ok(())
    }

    #[tokio::test]
    async fn users_only_select_their_orgs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persistence = persistence(&dir);
        orgs::save_org(
            &persistence,
            &orgs::Organization::new("acme", "Acme", "bob").with_member("alice", "member"),
        )?;
        orgs::save_org(&persistence, &orgs::Organization::new("beta", "Beta", "bob"))?;

        let alice = || router(&persistence, user_ctx("alice"));
        assert_eq!(call(alice(), Some("acme")).await?, (StatusCode::OK, "acme".to_string()));
        assert_eq!(call(alice(), None).await?, (StatusCode::OK, "default".to_string()));
        assert_eq!(call(alice(), Some("beta")).await?.0, StatusCode::FORBIDDEN);
        assert_eq!(call(alice(), Some("ghost")).await?.0, StatusCode::FORBIDDEN);

        let claimed = AuthContext {
            session_org: Some("beta".to_string()),
            ..user_ctx("alice")
        };
        assert_eq!(
            call(router(&persistence, claimed), None).await?.0,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            call(router(&persistence, user_ctx("bob")), Some("beta")).await?.1,
            "beta"
        );
        Ok(())
    }

    #[tokio::test]
    async fn guard_fails_closed_without_monitors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(None::<Arc<TenantMonitors>>, monitor_guard))
            .layer(from_fn_with_state(persistence(&dir), resolve_tenant))
            .layer(Extension(AuthContext::unauthenticated(None, None)));
        assert_eq!(call(app.clone(), None).await?.0, StatusCode::OK);
        assert_eq!(
            call(app, Some("acme")).await?.0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        Ok(())
    }

    #[tokio::test]
    async fn guard_attaches_tenant_monitor() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persistence = persistence(&dir);
        persistence.create_org_dir("acme")?;
        let monitors = Arc::new(TenantMonitors::new(Arc::clone(&persistence)));
        let app = Router::new()
            .route(
                "/",
                get(|Extension(monitor): Extension<Arc<TenantMonitor>>| async move {
                    monitor.org_id().to_string()
                }),
            )
            .layer(from_fn_with_state(Some(Arc::clone(&monitors)), monitor_guard))
            .layer(from_fn_with_state(persistence, resolve_tenant))
            .layer(Extension(AuthContext::unauthenticated(None, None)));
        assert_eq!(call(app.clone(), Some("acme")).await?, (StatusCode::OK, "acme".to_string()));
        assert_eq!(
            call(app, Some("ghost")).await?.0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(monitors.len(), 1);
        Ok(())
    }
}
