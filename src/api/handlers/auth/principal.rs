//! Authenticated principal and per-request auth context.
//!
//! Flow Overview: the auth context middleware resolves exactly one principal
//! per request and stores an [`AuthContext`] in the request extensions. Handlers
//! and gates read it back; nothing mutates it afterwards.

use std::net::IpAddr;

use super::{network::PeerInfo, tokens::ApiTokenRecord};

/// Who is calling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Principal {
    Anonymous,
    LocalUser { name: String },
    ProxyUser { name: String, admin: bool },
    OidcUser { name: String },
    Token(Box<ApiTokenRecord>),
}

impl Principal {
    /// Name used for audit records and `X-Authenticated-User`.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Anonymous => "anonymous".to_string(),
            Self::LocalUser { name } | Self::ProxyUser { name, .. } | Self::OidcUser { name } => {
                name.clone()
            }
            Self::Token(record) => record.principal_name(),
        }
    }

    /// Name of a human user, if the principal is one.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        match self {
            Self::LocalUser { name } | Self::ProxyUser { name, .. } | Self::OidcUser { name } => {
                Some(name.as_str())
            }
            Self::Anonymous | Self::Token(_) => None,
        }
    }

    #[must_use]
    pub fn token(&self) -> Option<&ApiTokenRecord> {
        match self {
            Self::Token(record) => Some(record),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Anonymous)
    }

    /// Proxy users need the admin role; everyone else who authenticated is
    /// admin-capable.
    #[must_use]
    pub fn is_admin_capable(&self) -> bool {
        match self {
            Self::ProxyUser { admin, .. } => *admin,
            _ => true,
        }
    }
}

/// How the principal authenticated (`X-Auth-Method`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
    Session,
    ApiToken,
    Proxy,
    Oidc,
    Bypass,
    None,
}

impl AuthMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Session => "session",
            Self::ApiToken => "api_token",
            Self::Proxy => "proxy",
            Self::Oidc => "oidc",
            Self::Bypass => "bypass",
            Self::None => "none",
        }
    }
}

/// Request-scoped auth result.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub principal: Principal,
    /// `None` when no mechanism matched.
    pub method: Option<AuthMethod>,
    pub client_ip: Option<IpAddr>,
    pub peer: Option<PeerInfo>,
    /// Org claimed by the session, if any.
    pub session_org: Option<String>,
}

impl AuthContext {
    #[must_use]
    pub fn unauthenticated(client_ip: Option<IpAddr>, peer: Option<PeerInfo>) -> Self {
        Self {
            principal: Principal::Anonymous,
            method: None,
            client_ip,
            peer,
            session_org: None,
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.method.is_some()
    }

    /// Client IP for logs and audit records; empty when unknown.
    #[must_use]
    pub fn client_ip_string(&self) -> String {
        self.client_ip.map(|ip| ip.to_string()).unwrap_or_default()
    }

    #[must_use]
    pub fn api_token(&self) -> Option<&ApiTokenRecord> {
        self.principal.token()
    }
}
