use crate::{
    api::{
        self, Services,
        handlers::{
            auth::{
                AuthConfig, AuthState, AuthStores, ProxyAuthConfig,
                network::TrustedProxies,
                oidc::{HttpTokenRefresher, OidcRefresher, OidcSettings},
            },
            tenant::{MonitorConfig, MultiTenantPersistence},
        },
        security_headers::SecurityHeaders,
    },
    cli::{
        commands::{auth, oidc, proxy, security},
        telemetry,
    },
};
use anyhow::{Context, Result};
use std::{path::PathBuf, sync::Arc};
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub data_dir: PathBuf,
    pub hosted: bool,
    pub multi_tenant: bool,
    pub auth: auth::Options,
    pub proxy: proxy::Options,
    pub oidc: oidc::Options,
    pub security: security::Options,
}

fn proxy_config(options: &proxy::Options) -> Option<ProxyAuthConfig> {
    options.secret.clone().map(|secret| {
        ProxyAuthConfig::new(secret)
            .with_user_header(options.user_header.clone())
            .with_role_header(options.role_header.clone())
            .with_role_separator(options.role_separator.clone())
            .with_admin_role(options.admin_role.clone())
    })
}

fn oidc_refresher(options: oidc::Options) -> Result<Option<Arc<OidcRefresher>>> {
    let Some(client) = options.client else {
        return Ok(None);
    };
    let issuer = client.issuer_url.clone();
    let refresher = HttpTokenRefresher::new(OidcSettings {
        issuer_url: client.issuer_url,
        token_url: client.token_url,
        client_id: client.client_id,
        client_secret: client.client_secret,
    })
    .context("Failed to build OIDC token client")?;
    Ok(Some(Arc::new(OidcRefresher::new(issuer, Arc::new(refresher)))))
}

/// Execute the server action.
/// # Errors
/// Returns an error if the data directory or stores cannot be opened, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("Failed to create data dir {}", args.data_dir.display()))?;

    let configured = args
        .auth
        .user
        .as_deref()
        .zip(args.auth.password.as_ref());
    let stores = AuthStores::open(&args.data_dir, configured)?;

    let config = AuthConfig::new()
        .with_session_ttl_seconds(args.auth.session_ttl_seconds)
        .with_proxy(proxy_config(&args.proxy))
        .with_oidc_enabled(args.oidc.enabled)
        .with_hosted(args.hosted)
        .with_strict_forwarded_proto(args.proxy.strict_forwarded_proto);

    let proxies = TrustedProxies::parse(&args.proxy.trusted_cidrs);
    let persistence = Arc::new(MultiTenantPersistence::new(
        &args.data_dir,
        MonitorConfig::default(),
    ));
    let audit = api::audit_dispatcher(&persistence, args.security.audit_persistent)?;

    let state = AuthState::new(config, stores)
        .with_trusted_proxies(proxies.clone())
        .with_audit(audit)
        .with_oidc(oidc_refresher(args.oidc)?)
        .with_bootstrap(&args.data_dir);

    let security = SecurityHeaders::new(
        args.security.allow_embedding,
        args.security.allowed_embed_origins,
        proxies,
    );
    let services = Services::new(Arc::new(state), persistence, args.multi_tenant, security);

    let result = api::new(args.port, services).await;
    telemetry::shutdown_tracer();
    result
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("data_dir", args.data_dir.display().to_string()),
        ("hosted", args.hosted.to_string()),
        ("multi_tenant", args.multi_tenant.to_string()),
        (
            "auth_user",
            args.auth.user.clone().unwrap_or_else(|| "n/a".to_string()),
        ),
        ("auth_pass_set", args.auth.password.is_some().to_string()),
        ("session_ttl_seconds", args.auth.session_ttl_seconds.to_string()),
        ("proxy_auth", args.proxy.secret.is_some().to_string()),
        (
            "trusted_proxies",
            if args.proxy.trusted_cidrs.is_empty() {
                "none".to_string()
            } else {
                args.proxy.trusted_cidrs.clone()
            },
        ),
        ("oidc", args.oidc.enabled.to_string()),
        ("audit_persistent", args.security.audit_persistent.to_string()),
        ("allow_embedding", args.security.allow_embedding.to_string()),
    ];
    log_entries("Startup configuration", &entries);
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!("{}\n\n{title}:", pulse_banner());
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn pulse_banner() -> String {
    let short_hash = short_commit(crate::GIT_COMMIT_HASH);
    PULSE_BANNER.replace(
        "{VERSION}",
        &format!(" - {} - {}", env!("CARGO_PKG_VERSION"), short_hash),
    )
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed).to_string()
}

const PULSE_BANNER: &str = r"
  _/\_/\_  P U L S E {VERSION}";

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn short_commit_truncates() {
        assert_eq!(short_commit("0123456789abcdef"), "0123456");
        assert_eq!(short_commit(" abc "), "abc");
    }

    #[test]
    fn proxy_config_requires_secret() {
        let mut options = proxy::Options {
            secret: None,
            user_header: Some("X-Remote-User".to_string()),
            role_header: None,
            role_separator: ",".to_string(),
            admin_role: "ops".to_string(),
            trusted_cidrs: String::new(),
            strict_forwarded_proto: false,
        };
        assert!(proxy_config(&options).is_none());

        options.secret = Some(SecretString::from("s3cret"));
        let config = proxy_config(&options);
        assert_eq!(
            config.as_ref().and_then(ProxyAuthConfig::user_header),
            Some("X-Remote-User")
        );
        assert_eq!(config.as_ref().map(ProxyAuthConfig::admin_role), Some("ops"));
    }

    #[test]
    fn oidc_disabled_has_no_refresher() -> Result<()> {
        let refresher = oidc_refresher(oidc::Options {
            enabled: false,
            client: None,
        })?;
        assert!(refresher.is_none());
        Ok(())
    }
}
