//! Audit log endpoints.
//!
//! Query, verification and export need a persistent back-end; with only the
//! console logger the list endpoint reports `persistentLogging: false` and the
//! rest answer 501.

use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{
    logger::AuditLogger,
    types::{AuditEvent, AuditFilter, AuditSummary, ExportFormat},
    webhooks::validate_webhook_url,
};
use crate::api::handlers::{
    auth::{AuthContext, AuthState},
    tenant::OrgContext,
};

pub const WEBHOOK_BODY_LIMIT: usize = 64 * 1024;
pub static X_EVENT_COUNT: HeaderName = HeaderName::from_static("x-event-count");

fn api_error(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}

fn not_implemented() -> Response {
    api_error(
        StatusCode::NOT_IMPLEMENTED,
        "not_implemented",
        "Persistent audit logging is not available",
    )
}

/// Query string accepted by the list, export and summary endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub event: Option<String>,
    pub user: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub success: Option<String>,
    pub format: Option<String>,
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|value| DateTime::parse_from_rfc3339(value.trim()).ok())
        .map(|time| time.with_timezone(&Utc))
}

impl AuditQuery {
    /// Unparseable values are ignored rather than rejected.
    #[must_use]
    pub fn filter(&self) -> AuditFilter {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        };
        AuditFilter {
            id: None,
            event: non_empty(&self.event),
            user: non_empty(&self.user),
            start_time: parse_time(self.start_time.as_deref()),
            end_time: parse_time(self.end_time.as_deref()),
            success: self.success.as_deref().and_then(|v| v.trim().parse().ok()),
            limit: self.limit.as_deref().and_then(|v| v.trim().parse().ok()),
            offset: self
                .offset
                .as_deref()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or_default(),
        }
    }
}

fn logger(state: &AuthState, org: &OrgContext) -> Arc<dyn AuditLogger> {
    state.audit().logger_for(&org.org_id)
}

/// `GET /api/audit`
pub async fn list_events(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(org): Extension<OrgContext>,
    Query(query): Query<AuditQuery>,
) -> Response {
    let logger = logger(&state, &org);
    let Some(store) = logger.persistent() else {
        return Json(json!({"events": [], "total": 0, "persistentLogging": false})).into_response();
    };
    let filter = query.filter();
    let events = match store.query(&filter) {
        Ok(events) => events,
        Err(err) => {
            error!(org_id = %org.org_id, "Failed to query audit events: {err}");
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Failed to query audit events",
            );
        }
    };
    match store.count(&filter) {
        Ok(total) => Json(json!({
            "events": events,
            "total": total,
            "persistentLogging": true,
        }))
        .into_response(),
        Err(err) => {
            error!(org_id = %org.org_id, "Failed to count audit events: {err}");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Failed to count audit events",
            )
        }
    }
}

/// `GET /api/audit/{id}/verify`
pub async fn verify_event(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(org): Extension<OrgContext>,
    Path(id): Path<String>,
) -> Response {
    let id = id.trim();
    if id.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "invalid_request", "Event ID is required");
    }
    let logger = logger(&state, &org);
    let Some(store) = logger.persistent() else {
        return Json(json!({
            "available": false,
            "verified": false,
            "message": "Signature verification requires persistent audit logging",
        }))
        .into_response();
    };
    if !store.can_verify() {
        return api_error(
            StatusCode::NOT_IMPLEMENTED,
            "not_implemented",
            "Signature verification is not supported by this audit backend",
        );
    }

    let filter = AuditFilter {
        id: Some(id.to_string()),
        limit: Some(1),
        ..AuditFilter::default()
    };
    let event: AuditEvent = match store.query(&filter) {
        Ok(events) => match events.into_iter().next() {
            Some(event) => event,
            None => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({"error": "Audit event not found"})),
                )
                    .into_response();
            }
        },
        Err(err) => {
            error!(org_id = %org.org_id, id, "Failed to load audit event: {err}");
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Failed to load audit event",
            );
        }
    };

    match store.verify_signature(&event) {
        Ok(verified) => {
            if !verified {
                warn!(target: "security", org_id = %org.org_id, id, "Audit event failed signature verification");
            }
            Json(json!({
                "available": true,
                "verified": verified,
                "message": if verified { "Signature verified" } else { "Signature verification failed" },
            }))
            .into_response()
        }
        Err(err) => {
            error!(org_id = %org.org_id, id, "Failed to verify audit event: {err}");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Failed to verify audit event",
            )
        }
    }
}

/// `GET /api/audit/export?format=json|csv`
pub async fn export_events(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(org): Extension<OrgContext>,
    Query(query): Query<AuditQuery>,
) -> Response {
    let logger = logger(&state, &org);
    let Some(store) = logger.persistent() else {
        return not_implemented();
    };
    let Some(format) = ExportFormat::parse(query.format.as_deref().unwrap_or_default()) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "invalid_format",
            "Format must be json or csv",
        );
    };
    let export = match store.export(&query.filter(), format) {
        Ok(export) => export,
        Err(err) => {
            error!(org_id = %org.org_id, "Failed to export audit events: {err}");
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Failed to export audit events",
            );
        }
    };
    let Ok(disposition) =
        HeaderValue::from_str(&format!("attachment; filename={}", export.filename))
    else {
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Failed to export audit events",
        );
    };
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(export.content_type)),
            (header::CONTENT_DISPOSITION, disposition),
            (X_EVENT_COUNT.clone(), HeaderValue::from(export.event_count)),
        ],
        export.data,
    )
        .into_response()
}

/// `GET /api/audit/summary`
pub async fn summary(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(org): Extension<OrgContext>,
    Query(query): Query<AuditQuery>,
) -> Response {
    let logger = logger(&state, &org);
    let Some(store) = logger.persistent() else {
        return not_implemented();
    };
    match store.query(&query.filter().unpaged()) {
        Ok(events) => Json(AuditSummary::from_events(&events)).into_response(),
        Err(err) => {
            error!(org_id = %org.org_id, "Failed to summarize audit events: {err}");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Failed to summarize audit events",
            )
        }
    }
}

/// `GET /api/admin/webhooks/audit`
pub async fn get_webhooks(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(org): Extension<OrgContext>,
) -> Response {
    let logger = logger(&state, &org);
    let urls = logger
        .persistent()
        .map(|store| store.webhook_urls())
        .unwrap_or_default();
    Json(json!({"urls": urls})).into_response()
}

#[derive(Debug, Deserialize)]
struct WebhookUpdate {
    #[serde(default)]
    urls: Vec<String>,
}

/// `POST /api/admin/webhooks/audit`
pub async fn update_webhooks(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(org): Extension<OrgContext>,
    Extension(ctx): Extension<AuthContext>,
    body: Bytes,
) -> Response {
    let Ok(update) = serde_json::from_slice::<WebhookUpdate>(&body) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid_request", "Invalid request body");
    };

    let mut urls = Vec::with_capacity(update.urls.len());
    for raw in &update.urls {
        match validate_webhook_url(raw).await {
            Ok(url) => urls.push(url.to_string()),
            Err(err) => {
                warn!(target: "security", url = %raw, "Rejected audit webhook URL: {err}");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "invalid_webhook_url",
                        "message": err.to_string(),
                        "url": raw,
                    })),
                )
                    .into_response();
            }
        }
    }

    let logger = logger(&state, &org);
    let Some(store) = logger.persistent() else {
        return not_implemented();
    };
    if let Err(err) = store.set_webhook_urls(urls.clone()) {
        error!(org_id = %org.org_id, "Failed to update audit webhooks: {err}");
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Failed to update audit webhooks",
        );
    }
    info!(org_id = %org.org_id, count = urls.len(), "Audit webhooks updated");
    state.audit().log_for_tenant(
        &org.org_id,
        AuditEvent::new("webhooks_updated")
            .user(&ctx.principal.name())
            .ip(&ctx.client_ip_string())
            .success(true)
            .details(&format!("{} webhook URLs", urls.len())),
    );
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::{
        audit::{AuditDispatcher, AuditError, FileAuditLogger, PersistentLogger},
        auth::{AuthConfig, AuthStores},
    };
    use anyhow::Result;

    /// Persistent back-end whose storage always fails.
    struct BrokenStore {
        verifies: bool,
    }

    impl AuditLogger for BrokenStore {
        fn log(&self, _event: &AuditEvent) -> Result<(), AuditError> {
            Ok(())
        }

        fn persistent(&self) -> Option<&dyn PersistentLogger> {
            Some(self)
        }
    }

    impl PersistentLogger for BrokenStore {
        fn query(&self, _filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
            Err(AuditError::Unsupported)
        }

        fn count(&self, _filter: &AuditFilter) -> Result<usize, AuditError> {
            Err(AuditError::Unsupported)
        }

        fn verify_signature(&self, _event: &AuditEvent) -> Result<bool, AuditError> {
            Err(AuditError::Unsupported)
        }

        fn can_verify(&self) -> bool {
            self.verifies
        }

        fn webhook_urls(&self) -> Vec<String> {
            Vec::new()
        }

        fn set_webhook_urls(&self, _urls: Vec<String>) -> Result<(), AuditError> {
            Err(AuditError::Unsupported)
        }
    }

    fn state_with(logger: Arc<dyn AuditLogger>) -> Arc<AuthState> {
        Arc::new(
            AuthState::new(AuthConfig::new(), AuthStores::in_memory())
                .with_audit(Arc::new(AuditDispatcher::new(logger))),
        )
    }

    fn console() -> Arc<AuthState> {
        Arc::new(AuthState::new(AuthConfig::new(), AuthStores::in_memory()))
    }

    fn file_logger(dir: &std::path::Path) -> Result<Arc<FileAuditLogger>> {
        let logger = Arc::new(FileAuditLogger::open(dir, None)?);
        logger.log(&AuditEvent::new("login").user("alice").success(true))?;
        logger.log(&AuditEvent::new("login").user("bob").success(false))?;
        Ok(logger)
    }

    async fn json_body(response: Response) -> Result<serde_json::Value> {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn org() -> Extension<OrgContext> {
        Extension(OrgContext::default())
    }

    fn admin() -> Extension<AuthContext> {
        Extension(AuthContext::unauthenticated(None, None))
    }

    #[test]
    fn query_parsing_ignores_garbage() {
        let query = AuditQuery {
            event: Some("login".to_string()),
            start_time: Some("not a time".to_string()),
            end_time: Some("2024-01-01T00:00:00Z".to_string()),
            limit: Some("ten".to_string()),
            offset: Some("5".to_string()),
            success: Some("true".to_string()),
            ..AuditQuery::default()
        };
        let filter = query.filter();
        assert_eq!(filter.event.as_deref(), Some("login"));
        assert!(filter.start_time.is_none());
        assert!(filter.end_time.is_some());
        assert_eq!(filter.limit, None);
        assert_eq!(filter.offset, 5);
        assert_eq!(filter.success, Some(true));
    }

    #[tokio::test]
    async fn console_only_backend() -> Result<()> {
        let list = list_events(Extension(console()), org(), Query(AuditQuery::default())).await;
        assert_eq!(
            json_body(list).await?,
            json!({"events": [], "total": 0, "persistentLogging": false})
        );

        let verify = verify_event(Extension(console()), org(), Path("abc".to_string())).await;
        assert_eq!(verify.status(), StatusCode::OK);
        let body = json_body(verify).await?;
        assert_eq!(body["available"], false);
        assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()));

        let export = export_events(Extension(console()), org(), Query(AuditQuery::default())).await;
        assert_eq!(export.status(), StatusCode::NOT_IMPLEMENTED);
        let summary = summary(Extension(console()), org(), Query(AuditQuery::default())).await;
        assert_eq!(summary.status(), StatusCode::NOT_IMPLEMENTED);

        let hooks = get_webhooks(Extension(console()), org()).await;
        assert_eq!(json_body(hooks).await?, json!({"urls": []}));
        Ok(())
    }

    #[tokio::test]
    async fn list_and_verify_with_file_backend() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let logger = file_logger(dir.path())?;
        let state = state_with(logger.clone());

        let list = list_events(
            Extension(Arc::clone(&state)),
            org(),
            Query(AuditQuery {
                user: Some("alice".to_string()),
                ..AuditQuery::default()
            }),
        )
        .await;
        let body = json_body(list).await?;
        assert_eq!(body["total"], 1);
        assert_eq!(body["persistentLogging"], true);

        let id = body["events"][0]["id"].as_str().unwrap_or_default().to_string();
        let verified = verify_event(Extension(Arc::clone(&state)), org(), Path(id)).await;
        let body = json_body(verified).await?;
        assert_eq!(body["available"], true);
        assert_eq!(body["verified"], true);

        let missing = verify_event(Extension(Arc::clone(&state)), org(), Path("missing".to_string())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(missing).await?["error"], "Audit event not found");

        let blank = verify_event(Extension(state), org(), Path(" ".to_string())).await;
        assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn export_sets_download_headers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let state = state_with(file_logger(dir.path())?);

        let csv = export_events(
            Extension(Arc::clone(&state)),
            org(),
            Query(AuditQuery {
                format: Some("csv".to_string()),
                ..AuditQuery::default()
            }),
        )
        .await;
        assert_eq!(csv.status(), StatusCode::OK);
        assert_eq!(csv.headers()[header::CONTENT_TYPE], "text/csv; charset=utf-8");
        assert!(
            csv.headers()[header::CONTENT_DISPOSITION]
                .to_str()?
                .starts_with("attachment; filename=audit-log-")
        );
        assert_eq!(csv.headers()[&X_EVENT_COUNT], "2");

        let bad = export_events(
            Extension(Arc::clone(&state)),
            org(),
            Query(AuditQuery {
                format: Some("xml".to_string()),
                ..AuditQuery::default()
            }),
        )
        .await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let summary = summary(Extension(state), org(), Query(AuditQuery::default())).await;
        let body = json_body(summary).await?;
        assert_eq!(body["totalEvents"], 2);
        assert_eq!(body["successCount"], 1);
        assert_eq!(body["failureCount"], 1);
        Ok(())
    }

    #[tokio::test]
    async fn backend_failures() -> Result<()> {
        let broken = state_with(Arc::new(BrokenStore { verifies: true }));
        let list = list_events(Extension(Arc::clone(&broken)), org(), Query(AuditQuery::default())).await;
        assert_eq!(list.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let verify = verify_event(Extension(Arc::clone(&broken)), org(), Path("abc".to_string())).await;
        assert_eq!(verify.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let export = export_events(Extension(Arc::clone(&broken)), org(), Query(AuditQuery::default())).await;
        assert_eq!(export.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let update = update_webhooks(
            Extension(broken),
            org(),
            admin(),
            Bytes::from_static(br#"{"urls":["https://93.184.216.34/hook"]}"#),
        )
        .await;
        assert_eq!(update.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let unverifiable = state_with(Arc::new(BrokenStore { verifies: false }));
        let verify = verify_event(Extension(unverifiable), org(), Path("abc".to_string())).await;
        assert_eq!(verify.status(), StatusCode::NOT_IMPLEMENTED);
        Ok(())
    }

    #[tokio::test]
    async fn webhook_updates_are_validated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let state = state_with(file_logger(dir.path())?);

        let ok = update_webhooks(
            Extension(Arc::clone(&state)),
            org(),
            admin(),
            Bytes::from_static(br#"{"urls":["https://93.184.216.34/hook"]}"#),
        )
        .await;
        assert_eq!(ok.status(), StatusCode::NO_CONTENT);
        let hooks = get_webhooks(Extension(Arc::clone(&state)), org()).await;
        assert_eq!(
            json_body(hooks).await?,
            json!({"urls": ["https://93.184.216.34/hook"]})
        );

        let loopback = update_webhooks(
            Extension(Arc::clone(&state)),
            org(),
            admin(),
            Bytes::from_static(br#"{"urls":["http://127.0.0.1/webhook"]}"#),
        )
        .await;
        assert_eq!(loopback.status(), StatusCode::BAD_REQUEST);

        let garbage = update_webhooks(
            Extension(Arc::clone(&state)),
            org(),
            admin(),
            Bytes::from_static(b"invalid"),
        )
        .await;
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);

        let console_only = update_webhooks(
            Extension(console()),
            org(),
            admin(),
            Bytes::from_static(br#"{"urls":[]}"#),
        )
        .await;
        assert_eq!(console_only.status(), StatusCode::NOT_IMPLEMENTED);
        Ok(())
    }
}
