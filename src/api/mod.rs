use crate::api::handlers::{
    audit::{self, AuditDispatcher},
    auth::{
        AuthState, MAINTENANCE_INTERVAL, PermissionGate, auth_context, bootstrap, check_csrf,
        csrf, login,
        network::PeerInfo,
        require_admin, require_auth, require_permission, require_scope, spawn_maintenance,
        tokens::{SCOPE_SETTINGS_READ, SCOPE_SETTINGS_WRITE},
    },
    health,
    tenant::{
        MultiTenantPersistence, TenantMonitors, monitor_guard, orgs, resolve_tenant,
        rbac::{
            ACTION_ADMIN, ACTION_READ, Authorizer, RESOURCE_AUDIT_LOGS, RESOURCE_USERS,
            RbacAuthorizer, TenantRbacProvider,
        },
        roles,
    },
};
use anyhow::Result;
use axum::{
    Extension, Router,
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath},
    http::{HeaderName, HeaderValue, Request},
    middleware::from_fn_with_state,
    routing::{MethodRouter, delete, get, post, put},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

pub mod handlers;
pub mod security_headers;

use self::security_headers::SecurityHeaders;

/// Shared state behind the router.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<AuthState>,
    pub persistence: Arc<MultiTenantPersistence>,
    pub rbac: Arc<TenantRbacProvider>,
    /// `None` when multi-tenant monitoring is disabled.
    pub monitors: Option<Arc<TenantMonitors>>,
    pub security: Arc<SecurityHeaders>,
}

impl Services {
    #[must_use]
    pub fn new(
        auth: Arc<AuthState>,
        persistence: Arc<MultiTenantPersistence>,
        multi_tenant: bool,
        security: SecurityHeaders,
    ) -> Self {
        let monitors =
            multi_tenant.then(|| Arc::new(TenantMonitors::new(Arc::clone(&persistence))));
        Self {
            auth,
            rbac: Arc::new(TenantRbacProvider::new(Arc::clone(&persistence))),
            persistence,
            monitors,
            security: Arc::new(security),
        }
    }

    /// Flush stores and release tenant resources.
    pub fn close(&self) {
        self.auth.close();
        if let Some(monitors) = &self.monitors {
            monitors.close();
        }
        self.rbac.close();
    }
}

/// Per-route gate composition. The last layer added runs first.
struct Gates {
    auth: Arc<AuthState>,
    authorizer: Arc<dyn Authorizer>,
}

impl Gates {
    fn user(&self, route: MethodRouter) -> MethodRouter {
        route
            .route_layer(from_fn_with_state(Arc::clone(&self.auth), check_csrf))
            .route_layer(from_fn_with_state(Arc::clone(&self.auth), require_auth))
    }

    fn admin(
        &self,
        route: MethodRouter,
        scope: &'static str,
        permission: Option<(&'static str, &'static str)>,
    ) -> MethodRouter {
        let mut route = route
            .route_layer(from_fn_with_state(Arc::clone(&self.auth), check_csrf))
            .route_layer(from_fn_with_state(scope, require_scope));
        if let Some((action, resource)) = permission {
            let gate = PermissionGate::new(action, resource, Arc::clone(&self.authorizer));
            route = route.route_layer(from_fn_with_state(gate, require_permission));
        }
        route.route_layer(from_fn_with_state(Arc::clone(&self.auth), require_admin))
    }
}

/// Build the application router with every route and global layer.
#[must_use]
pub fn router(services: &Services) -> Router {
    let gates = Gates {
        auth: Arc::clone(&services.auth),
        authorizer: Arc::new(RbacAuthorizer::new(Arc::clone(&services.rbac))),
    };
    let audit_read = Some((ACTION_READ, RESOURCE_AUDIT_LOGS));
    let manage_users = Some((ACTION_ADMIN, RESOURCE_USERS));

    Router::new()
        .route("/api/login", post(login::login))
        .route("/api/logout", gates.user(post(login::logout)))
        .route("/api/bootstrap/validate", post(bootstrap::validate))
        .route(
            "/api/security/validate-bootstrap-token",
            post(bootstrap::validate),
        )
        .route("/api/security/quick-setup", post(login::quick_setup))
        .route(
            "/api/security/reset-lockout",
            gates.admin(post(login::reset_lockout), SCOPE_SETTINGS_WRITE, None),
        )
        .route(
            "/api/audit",
            gates.admin(get(audit::handlers::list_events), SCOPE_SETTINGS_READ, audit_read),
        )
        .route(
            "/api/audit/export",
            gates.admin(get(audit::handlers::export_events), SCOPE_SETTINGS_READ, audit_read),
        )
        .route(
            "/api/audit/summary",
            gates.admin(get(audit::handlers::summary), SCOPE_SETTINGS_READ, audit_read),
        )
        .route(
            "/api/audit/{id}/verify",
            gates.admin(get(audit::handlers::verify_event), SCOPE_SETTINGS_READ, audit_read),
        )
        .route(
            "/api/admin/webhooks/audit",
            gates
                .admin(get(audit::handlers::get_webhooks), SCOPE_SETTINGS_READ, None)
                .merge(
                    gates
                        .admin(
                            post(audit::handlers::update_webhooks),
                            SCOPE_SETTINGS_WRITE,
                            None,
                        )
                        .layer(DefaultBodyLimit::max(audit::handlers::WEBHOOK_BODY_LIMIT)),
                ),
        )
        .route(
            "/api/admin/roles",
            gates
                .admin(get(roles::list_roles), SCOPE_SETTINGS_READ, manage_users)
                .merge(gates.admin(post(roles::create_role), SCOPE_SETTINGS_WRITE, manage_users)),
        )
        .route(
            "/api/admin/roles/{id}",
            gates
                .admin(get(roles::get_role), SCOPE_SETTINGS_READ, manage_users)
                .merge(gates.admin(put(roles::update_role), SCOPE_SETTINGS_WRITE, manage_users))
                .merge(gates.admin(delete(roles::delete_role), SCOPE_SETTINGS_WRITE, manage_users)),
        )
        .route(
            "/api/admin/users/{username}/roles",
            gates.admin(put(roles::assign_user_roles), SCOPE_SETTINGS_WRITE, manage_users),
        )
        .route("/api/orgs/{id}", gates.user(get(orgs::get_org)))
        .route(
            "/api/admin/orgs/{id}/billing-state",
            gates.admin(get(orgs::billing_state), "", None),
        )
        .layer(from_fn_with_state(services.monitors.clone(), monitor_guard))
        .layer(from_fn_with_state(Arc::clone(&services.persistence), resolve_tenant))
        .layer(from_fn_with_state(Arc::clone(&services.auth), auth_context))
        .layer(Extension(Arc::clone(&services.auth)))
        .layer(Extension(Arc::clone(&services.persistence)))
        .layer(Extension(Arc::clone(&services.rbac)))
        .route("/health", get(health).options(health))
        .layer(from_fn_with_state(
            Arc::clone(&services.security),
            security_headers::security_headers,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span)),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, services: Services) -> Result<()> {
    let cleanup = csrf::spawn_cleanup(Arc::clone(services.auth.csrf()), csrf::CSRF_CLEANUP_INTERVAL);
    let maintenance = spawn_maintenance(Arc::clone(&services.auth), MAINTENANCE_INTERVAL);

    let app = router(&services);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<PeerInfo>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    cleanup.abort();
    maintenance.abort();
    services.close();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Gracefully shutdown");
}

/// Audit sink for [`AuthState::with_audit`]; persistent per-tenant files when
/// enabled, console otherwise.
///
/// # Errors
/// Return error if the webhook client cannot be built
pub fn audit_dispatcher(
    persistence: &Arc<MultiTenantPersistence>,
    persistent: bool,
) -> Result<Arc<AuditDispatcher>> {
    let dispatcher = Arc::new(AuditDispatcher::console());
    if persistent {
        let sender = audit::WebhookSender::new()?;
        let factory = audit::FileLoggerFactory::new(Arc::clone(persistence), Some(sender));
        dispatcher.set_tenant_manager(Arc::new(audit::TenantLoggerManager::new(Arc::new(
            factory,
        ))));
    }
    Ok(dispatcher)
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
