//! Session and CSRF cookie helpers.
//!
//! `Secure` and `SameSite` are derived per request from the connection and the
//! proxy headers it carries:
//!
//! | native TLS | proxy detected             | Secure | SameSite |
//! |------------|----------------------------|--------|----------|
//! | yes        | any                        | true   | Lax      |
//! | no         | yes, forwarded proto https | true   | None     |
//! | no         | yes, otherwise             | false  | Lax      |
//! | no         | no                         | false  | Lax      |

use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, InvalidHeaderValue},
};

use super::network::{PeerInfo, TrustedProxies, forwarded_proto_is_https};

pub const SESSION_COOKIE: &str = "pulse_session";
pub const CSRF_COOKIE: &str = "pulse_csrf";
pub const COOKIE_MAX_AGE_SECONDS: i64 = 86_400;

const PROXY_HEADERS: [&str; 7] = [
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-scheme",
    "x-real-ip",
    "forwarded",
    "cf-ray",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    None,
}

impl SameSite {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Lax => "Lax",
            Self::None => "None",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CookieSettings {
    pub secure: bool,
    pub same_site: SameSite,
}

/// Whether the request carries headers set by a reverse proxy or tunnel.
pub(crate) fn proxy_detected(headers: &HeaderMap) -> bool {
    PROXY_HEADERS.iter().any(|name| headers.contains_key(*name))
}

/// Decide `Secure` and `SameSite` for cookies on this response.
///
/// With `strict` set, forwarded HTTPS only counts when the peer is a trusted
/// proxy.
pub(crate) fn cookie_settings(
    headers: &HeaderMap,
    peer: Option<PeerInfo>,
    proxies: &TrustedProxies,
    strict: bool,
) -> CookieSettings {
    if peer.is_some_and(|p| p.tls) {
        return CookieSettings {
            secure: true,
            same_site: SameSite::Lax,
        };
    }
    if proxy_detected(headers) && forwarded_proto_is_https(headers) {
        let trusted = peer.is_some_and(|p| proxies.contains(p.ip()));
        if !strict || trusted {
            return CookieSettings {
                secure: true,
                same_site: SameSite::None,
            };
        }
    }
    CookieSettings {
        secure: false,
        same_site: SameSite::Lax,
    }
}

fn build(
    name: &str,
    value: &str,
    settings: CookieSettings,
    max_age: i64,
    http_only: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{name}={value}; Path=/; Max-Age={max_age}; SameSite={}",
        settings.same_site.as_str()
    );
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if settings.secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// `HttpOnly` session cookie.
pub(crate) fn session_cookie(
    token: &str,
    settings: CookieSettings,
    max_age: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    build(SESSION_COOKIE, token, settings, max_age, true)
}

/// CSRF cookie; readable by scripts so the UI can echo it back.
pub(crate) fn csrf_cookie(
    token: &str,
    settings: CookieSettings,
    max_age: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    build(CSRF_COOKIE, token, settings, max_age, false)
}

pub(crate) fn clear_session_cookie(
    settings: CookieSettings,
) -> Result<HeaderValue, InvalidHeaderValue> {
    build(SESSION_COOKIE, "", settings, 0, true)
}

pub(crate) fn clear_csrf_cookie(
    settings: CookieSettings,
) -> Result<HeaderValue, InvalidHeaderValue> {
    build(CSRF_COOKIE, "", settings, 0, false)
}

/// Value of the named cookie, if present and non-empty.
pub(crate) fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
