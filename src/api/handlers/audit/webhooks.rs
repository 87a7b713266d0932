//! Audit webhook URL validation and delivery.

use std::{
    future::Future,
    io,
    net::IpAddr,
    pin::Pin,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, warn};
use url::Url;

use super::types::AuditEvent;
use crate::api::handlers::auth::network::is_private;

pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

const METADATA_HOSTS: [&str; 5] = [
    "169.254.169.254",
    "metadata",
    "metadata.google",
    "metadata.google.internal",
    "metadata.goog",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook URL is empty")]
    Empty,
    #[error("invalid webhook URL: {0}")]
    Invalid(String),
    #[error("webhook URL must use http or https")]
    Scheme,
    #[error("webhook URL must include a host")]
    MissingHost,
    #[error("webhook URLs pointing to {0} are not allowed")]
    ForbiddenHost(String),
    #[error("webhook URL resolves to private or reserved address {0}")]
    PrivateAddress(IpAddr),
    #[error("failed to resolve webhook host {host}: {reason}")]
    Resolution { host: String, reason: String },
}

/// Resolves a host to its addresses.
pub trait HostResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + 'a>>;
}

/// System DNS through tokio.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + 'a>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, port)).await?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        })
    }
}

/// Private, loopback, link-local, multicast, unspecified and `0.0.0.0/8`.
#[must_use]
pub fn is_private_or_reserved(ip: IpAddr) -> bool {
    if is_private(ip) {
        return true;
    }
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            v4.is_unspecified() || v4.is_multicast() || v4.is_broadcast() || v4.octets()[0] == 0
        }
        IpAddr::V6(v6) => v6.is_unspecified() || v6.is_multicast(),
    }
}

fn forbidden_host(host: &str) -> Option<String> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") {
        return Some("localhost".to_string());
    }
    if METADATA_HOSTS.contains(&host.as_str()) {
        return Some("cloud metadata services".to_string());
    }
    if host.ends_with(".local") || host.ends_with(".internal") || host.starts_with("internal.") {
        return Some("internal hostnames".to_string());
    }
    None
}

/// Validate one webhook URL using `resolver` for name lookups.
///
/// # Errors
/// Returns the first rule the URL violates.
pub async fn validate_webhook_url_with(
    raw: &str,
    resolver: &dyn HostResolver,
) -> Result<Url, WebhookError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(WebhookError::Empty);
    }
    if raw.chars().any(char::is_control) {
        return Err(WebhookError::Invalid("control characters".to_string()));
    }
    let url = Url::parse(raw).map_err(|err| WebhookError::Invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WebhookError::Scheme);
    }
    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host.trim_matches(|c| c == '[' || c == ']').to_string(),
        _ => return Err(WebhookError::MissingHost),
    };
    if let Some(reason) = forbidden_host(&host) {
        return Err(WebhookError::ForbiddenHost(reason));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_or_reserved(ip) {
            return Err(WebhookError::PrivateAddress(ip));
        }
        return Ok(url);
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let resolved = tokio::time::timeout(RESOLVE_TIMEOUT, resolver.resolve(&host, port))
        .await
        .map_err(|_| WebhookError::Resolution {
            host: host.clone(),
            reason: "timed out".to_string(),
        })?
        .map_err(|err| WebhookError::Resolution {
            host: host.clone(),
            reason: err.to_string(),
        })?;
    if resolved.is_empty() {
        return Err(WebhookError::Resolution {
            host,
            reason: "no addresses".to_string(),
        });
    }
    if let Some(ip) = resolved.into_iter().find(|ip| is_private_or_reserved(*ip)) {
        return Err(WebhookError::PrivateAddress(ip));
    }
    Ok(url)
}

/// Validate one webhook URL against system DNS.
///
/// # Errors
/// Returns the first rule the URL violates.
pub async fn validate_webhook_url(raw: &str) -> Result<Url, WebhookError> {
    validate_webhook_url_with(raw, &SystemResolver).await
}

/// Best-effort POST of audit events to configured URLs.
#[derive(Clone, Debug)]
pub struct WebhookSender {
    client: reqwest::Client,
}

impl WebhookSender {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Spawn one detached delivery per URL. No-op outside a tokio runtime.
    pub fn deliver(&self, urls: &[String], event: &AuditEvent) {
        if urls.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, skipping audit webhook delivery");
            return;
        };
        let event = Arc::new(event.clone());
        for url in urls {
            let client = self.client.clone();
            let url = url.clone();
            let event = Arc::clone(&event);
            handle.spawn(async move {
                match client.post(&url).json(event.as_ref()).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(url, "Audit webhook delivered");
                    }
                    Ok(response) => warn!(url, status = %response.status(), "Audit webhook rejected"),
                    Err(err) => warn!(url, "Audit webhook delivery failed: {err}"),
                }
            });
        }
    }
}
