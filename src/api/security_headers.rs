//! Browser hardening headers added to every response.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::api::handlers::auth::network::{PeerInfo, TrustedProxies, peer_info};

const PERMISSIONS_POLICY: &str = "geolocation=(), microphone=(), camera=(), payment=(), usb=(), magnetometer=(), gyroscope=(), accelerometer=()";
const HSTS: &str = "max-age=31536000; includeSubDomains";
const CSP_BASE: &str = "default-src 'self'; script-src 'self' 'unsafe-inline' 'unsafe-eval'; style-src 'self' 'unsafe-inline'; img-src 'self' data: blob:; connect-src 'self' ws: wss:; font-src 'self' data:";

static X_XSS_PROTECTION: HeaderName = HeaderName::from_static("x-xss-protection");
static PERMISSIONS_POLICY_HEADER: HeaderName = HeaderName::from_static("permissions-policy");

#[derive(Clone, Debug, Default)]
pub struct SecurityHeaders {
    allow_embedding: bool,
    allowed_origins: Vec<String>,
    proxies: TrustedProxies,
}

impl SecurityHeaders {
    #[must_use]
    pub fn new(allow_embedding: bool, allowed_origins: Vec<String>, proxies: TrustedProxies) -> Self {
        Self {
            allow_embedding,
            allowed_origins: allowed_origins
                .into_iter()
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            proxies,
        }
    }

    fn frame_ancestors(&self) -> String {
        if !self.allow_embedding {
            return "'none'".to_string();
        }
        let mut sources = vec!["'self'".to_string()];
        sources.extend(self.allowed_origins.iter().cloned());
        sources.join(" ")
    }

    /// Native TLS, or a trusted proxy reporting HTTPS.
    #[must_use]
    pub fn is_https(&self, headers: &HeaderMap, peer: Option<PeerInfo>) -> bool {
        let Some(peer) = peer else {
            return false;
        };
        if peer.tls {
            return true;
        }
        if !self.proxies.contains(peer.ip()) {
            return false;
        }
        ["x-forwarded-proto", "x-forwarded-scheme"].iter().any(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("https"))
        })
    }

    #[must_use]
    pub fn content_security_policy(&self, https: bool) -> String {
        let mut csp = format!("{CSP_BASE}; frame-ancestors {}", self.frame_ancestors());
        if https {
            csp.push_str("; upgrade-insecure-requests");
        }
        csp
    }

    fn apply(&self, headers: &mut HeaderMap, https: bool) {
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        headers.insert(X_XSS_PROTECTION.clone(), HeaderValue::from_static("0"));
        if !self.allow_embedding {
            headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
        }
        headers.insert(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        );
        headers.insert(
            PERMISSIONS_POLICY_HEADER.clone(),
            HeaderValue::from_static(PERMISSIONS_POLICY),
        );
        match HeaderValue::from_str(&self.content_security_policy(https)) {
            Ok(csp) => {
                headers.insert(header::CONTENT_SECURITY_POLICY, csp);
            }
            Err(err) => warn!("Invalid Content-Security-Policy, check embed origins: {err}"),
        }
        if https {
            headers.insert(
                header::STRICT_TRANSPORT_SECURITY,
                HeaderValue::from_static(HSTS),
            );
        }
    }
}

pub async fn security_headers(
    State(policy): State<Arc<SecurityHeaders>>,
    request: Request,
    next: Next,
) -> Response {
    let https = policy.is_https(request.headers(), peer_info(request.extensions()));
    let mut response = next.run(request).await;
    policy.apply(response.headers_mut(), https);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::{
        Router, body::Body, extract::connect_info::MockConnectInfo, middleware::from_fn_with_state,
        routing::get,
    };
    use tower::ServiceExt;

    fn peer(addr: &str, tls: bool) -> Option<PeerInfo> {
        addr.parse().ok().map(|addr| PeerInfo { addr, tls })
    }

    fn forwarded_https() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers
    }

    #[test]
    fn hsts_requires_genuine_https() {
        let policy = SecurityHeaders::new(false, Vec::new(), TrustedProxies::parse("10.0.0.1"));
        assert!(policy.is_https(&HeaderMap::new(), peer("203.0.113.5:443", true)));
        assert!(policy.is_https(&forwarded_https(), peer("10.0.0.1:5000", false)));
        assert!(!policy.is_https(&forwarded_https(), peer("203.0.113.5:5000", false)));
        assert!(!policy.is_https(&HeaderMap::new(), peer("10.0.0.1:5000", false)));
        assert!(!policy.is_https(&forwarded_https(), None));
    }

    #[test]
    fn frame_ancestors_follow_embedding() {
        let closed = SecurityHeaders::default();
        assert!(closed.content_security_policy(false).ends_with("frame-ancestors 'none'"));

        let open = SecurityHeaders::new(
            true,
            vec!["https://dash.example.com".to_string(), " ".to_string()],
            TrustedProxies::default(),
        );
        let csp = open.content_security_policy(true);
        assert!(csp.contains("frame-ancestors 'self' https://dash.example.com; upgrade-insecure-requests"));
    }

    #[tokio::test]
    async fn headers_are_set_on_every_response() -> Result<()> {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(
                Arc::new(SecurityHeaders::default()),
                security_headers,
            ))
            .layer(MockConnectInfo(PeerInfo::plain("203.0.113.5:4000".parse()?)));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty())?)
            .await?;
        let headers = response.headers();
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers["x-xss-protection"], "0");
        assert_eq!(headers[header::REFERRER_POLICY], "strict-origin-when-cross-origin");
        assert!(headers.contains_key("permissions-policy"));
        assert!(headers.contains_key(header::CONTENT_SECURITY_POLICY));
        assert!(!headers.contains_key(header::STRICT_TRANSPORT_SECURITY));
        Ok(())
    }
}
