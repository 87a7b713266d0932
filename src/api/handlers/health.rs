use crate::GIT_COMMIT_HASH;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    status: String,
    name: String,
    version: String,
    commit: String,
}

/// Liveness probe. `HEAD`/`OPTIONS` get the `X-App` header without a body.
pub async fn health(method: Method) -> impl IntoResponse {
    let commit = GIT_COMMIT_HASH.trim();
    let health = Health {
        status: "ok".to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: commit.to_string(),
    };

    let mut headers = HeaderMap::new();
    let app = format!(
        "{}:{}:{}",
        health.name,
        health.version,
        commit.get(..7).unwrap_or_default()
    );
    match HeaderValue::from_str(&app) {
        Ok(value) => {
            headers.insert("X-App", value);
        }
        Err(err) => warn!("Invalid X-App header {app:?}: {err}"),
    }

    if method == Method::GET {
        (headers, Json(health)).into_response()
    } else {
        (headers, Body::empty()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn reports_ok_with_version() -> Result<()> {
        let response = health(Method::GET).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let x_app = response
            .headers()
            .get("X-App")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(x_app.starts_with(env!("CARGO_PKG_NAME")));

        let body = axum::body::to_bytes(response.into_body(), 1024).await?;
        let json: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["commit"], GIT_COMMIT_HASH);
        Ok(())
    }

    #[tokio::test]
    async fn head_has_no_body() -> Result<()> {
        let response = health(Method::HEAD).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), 1024).await?;
        assert!(body.is_empty());
        Ok(())
    }
}
