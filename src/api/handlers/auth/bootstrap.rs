//! First-boot bootstrap token.
//!
//! When nothing can authenticate a request, a one-time token is written to
//! `<dataDir>/.bootstrap_token` and only its hash is kept in memory. Whoever can
//! read the file on the host can finish initial setup.

use axum::{
    Extension, Json,
    body::Bytes,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use rand::{RngCore, rngs::OsRng};
use serde::Deserialize;
use serde_json::json;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{error, info, warn};

use super::{
    principal::AuthContext,
    rate_limit::{RateLimitAction, RateLimitDecision},
    state::AuthState,
    utils::{constant_time_eq, sha256_hex},
};
use crate::api::handlers::persist::{StoreError, write_atomic};

pub const BOOTSTRAP_TOKEN_FILE: &str = ".bootstrap_token";
pub const BOOTSTRAP_TOKEN_HEADER: &str = "x-setup-token";
const BOOTSTRAP_TOKEN_BYTES: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("data path required for bootstrap token")]
    MissingDataPath,
    #[error("bootstrap token file is empty")]
    EmptyFile,
    #[error("failed to read bootstrap token {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Loaded or freshly created token.
#[derive(Debug)]
pub struct LoadedToken {
    pub token: String,
    pub created: bool,
    pub path: PathBuf,
}

fn generate_bootstrap_token() -> Result<String, BootstrapError> {
    let mut bytes = [0u8; BOOTSTRAP_TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| StoreError::Random(err.to_string()))?;
    Ok(hex::encode(bytes))
}

/// Read `<data_dir>/.bootstrap_token`, creating it (mode 0600) if absent.
///
/// # Errors
/// Fails on an empty data path, an empty token file, or any I/O error.
pub fn load_or_create(data_dir: &Path) -> Result<LoadedToken, BootstrapError> {
    if data_dir.as_os_str().to_string_lossy().trim().is_empty() {
        return Err(BootstrapError::MissingDataPath);
    }
    let path = data_dir.join(BOOTSTRAP_TOKEN_FILE);
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let token = contents.trim();
            if token.is_empty() {
                return Err(BootstrapError::EmptyFile);
            }
            Ok(LoadedToken {
                token: token.to_string(),
                created: false,
                path,
            })
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let token = generate_bootstrap_token()?;
            write_atomic(&path, format!("{token}\n").as_bytes())?;
            Ok(LoadedToken {
                token,
                created: true,
                path,
            })
        }
        Err(source) => Err(BootstrapError::Read {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[derive(Debug, Default)]
struct Inner {
    hash: Option<String>,
    path: Option<PathBuf>,
    claimed: bool,
}

/// In-memory view of the bootstrap token.
#[derive(Debug, Default)]
pub struct BootstrapToken {
    inner: RwLock<Inner>,
}

impl BootstrapToken {
    /// Issue or purge the token depending on whether any auth is configured.
    ///
    /// With auth configured (or in hosted mode) a leftover token file is removed.
    #[must_use]
    pub fn initialize(data_dir: &Path, auth_configured: bool, hosted: bool) -> Self {
        let token = Self::default();
        if auth_configured || hosted {
            let path = data_dir.join(BOOTSTRAP_TOKEN_FILE);
            match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "Removed bootstrap token; authentication is configured"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), "Failed to remove bootstrap token: {err}"),
            }
            return token;
        }
        match load_or_create(data_dir) {
            Ok(loaded) => {
                if loaded.created {
                    warn!(
                        path = %loaded.path.display(),
                        "No authentication configured; generated bootstrap setup token"
                    );
                } else {
                    info!(path = %loaded.path.display(), "Using existing bootstrap setup token");
                }
                let mut inner = token.inner.write().unwrap_or_else(PoisonError::into_inner);
                inner.hash = Some(sha256_hex(&loaded.token));
                inner.path = Some(loaded.path);
            }
            Err(err) => error!("Failed to prepare bootstrap token: {err}"),
        }
        token
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hash
            .is_some()
    }

    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .path
            .clone()
    }

    /// Constant-time comparison against the stored hash. Surrounding whitespace
    /// is ignored.
    #[must_use]
    pub fn validate(&self, provided: &str) -> bool {
        let provided = provided.trim();
        if provided.is_empty() {
            return false;
        }
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .hash
            .as_deref()
            .is_some_and(|hash| constant_time_eq(hash, &sha256_hex(provided)))
    }

    /// Reserve the token for one setup attempt.
    ///
    /// Returns `None` when the token is gone or another attempt holds it. The
    /// token stays valid until the claim is committed; dropping the claim
    /// releases it for a retry.
    pub fn claim(&self) -> Option<BootstrapClaim<'_>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.hash.is_none() || inner.claimed {
            return None;
        }
        inner.claimed = true;
        Some(BootstrapClaim {
            token: self,
            committed: false,
        })
    }

    fn release(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .claimed = false;
    }

    /// Forget the token and delete its file. Returns `true` only for the call
    /// that actually cleared it.
    pub fn clear(&self) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.claimed = false;
        if inner.hash.take().is_none() {
            return false;
        }
        if let Some(path) = inner.path.take() {
            match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "Bootstrap token cleared"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), "Failed to delete bootstrap token file: {err}"),
            }
        }
        true
    }
}

/// Exclusive hold on the bootstrap token during quick setup.
#[derive(Debug)]
#[must_use]
pub struct BootstrapClaim<'a> {
    token: &'a BootstrapToken,
    committed: bool,
}

impl BootstrapClaim<'_> {
    /// Setup succeeded: clear the token and delete its file.
    pub fn commit(mut self) {
        self.committed = true;
        self.token.clear();
    }
}

impl Drop for BootstrapClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.token.release();
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ValidateRequest {
    #[serde(default)]
    token: String,
}

/// Extract the token from `X-Setup-Token` or a JSON body `{token}`.
pub(crate) fn provided_token(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if let Some(token) = headers
        .get(BOOTSTRAP_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }
    serde_json::from_slice::<ValidateRequest>(body)
        .ok()
        .map(|req| req.token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// `POST /api/bootstrap/validate`
pub async fn validate(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_ip = ctx.client_ip_string();
    if state.rate_limiter().check(&client_ip, RateLimitAction::Bootstrap) == RateLimitDecision::Limited {
        warn!(target: "security", ip = %client_ip, "Rate limit exceeded for bootstrap token validation");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "Too many validation attempts"})),
        )
            .into_response();
    }

    let bootstrap = state.bootstrap();
    if !bootstrap.is_active() {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "Bootstrap token unavailable"})),
        )
            .into_response();
    }

    match provided_token(&headers, &body) {
        Some(token) if bootstrap.validate(&token) => {
            info!(ip = %client_ip, "Bootstrap token validated");
            StatusCode::NO_CONTENT.into_response()
        }
        _ => {
            warn!(target: "security", ip = %client_ip, "Rejected invalid bootstrap token");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Invalid bootstrap setup token"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::http::HeaderValue;

    #[test]
    fn empty_data_path_is_rejected() {
        assert!(matches!(
            load_or_create(Path::new("  ")),
            Err(BootstrapError::MissingDataPath)
        ));
    }

    #[test]
    fn creates_token_file_with_newline() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let loaded = load_or_create(dir.path())?;
        assert!(loaded.created);
        assert_eq!(loaded.token.len(), BOOTSTRAP_TOKEN_BYTES * 2);
        assert!(loaded.token.chars().all(|c| c.is_ascii_hexdigit()));
        let contents = fs::read_to_string(&loaded.path)?;
        assert_eq!(contents, format!("{}\n", loaded.token));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&loaded.path)?.permissions().mode() & 0o777, 0o600);
        }
        Ok(())
    }

    #[test]
    fn existing_token_is_reused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(BOOTSTRAP_TOKEN_FILE), "myexistingtoken123\n")?;
        let loaded = load_or_create(dir.path())?;
        assert!(!loaded.created);
        assert_eq!(loaded.token, "myexistingtoken123");
        Ok(())
    }

    #[test]
    fn whitespace_file_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(BOOTSTRAP_TOKEN_FILE), "   \n\t  \n")?;
        assert!(matches!(
            load_or_create(dir.path()),
            Err(BootstrapError::EmptyFile)
        ));
        Ok(())
    }

    #[test]
    fn validate_trims_and_rejects_wrong_tokens() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bootstrap = BootstrapToken::initialize(dir.path(), false, false);
        assert!(bootstrap.is_active());
        let token = fs::read_to_string(dir.path().join(BOOTSTRAP_TOKEN_FILE))?;
        let token = token.trim();
        assert!(bootstrap.validate(token));
        assert!(bootstrap.validate(&format!("  {token}  ")));
        assert!(!bootstrap.validate("wrongtoken"));
        assert!(!bootstrap.validate("   "));
        Ok(())
    }

    #[test]
    fn configured_auth_purges_token() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let _ = BootstrapToken::initialize(dir.path(), false, false);
        assert!(dir.path().join(BOOTSTRAP_TOKEN_FILE).exists());

        let bootstrap = BootstrapToken::initialize(dir.path(), true, false);
        assert!(!bootstrap.is_active());
        assert!(!dir.path().join(BOOTSTRAP_TOKEN_FILE).exists());
        Ok(())
    }

    #[test]
    fn hosted_mode_never_issues_token() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bootstrap = BootstrapToken::initialize(dir.path(), false, true);
        assert!(!bootstrap.is_active());
        assert!(!dir.path().join(BOOTSTRAP_TOKEN_FILE).exists());
        Ok(())
    }

    #[test]
    fn clear_happens_exactly_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bootstrap = BootstrapToken::initialize(dir.path(), false, false);
        assert!(bootstrap.clear());
        assert!(!bootstrap.clear());
        assert!(!bootstrap.is_active());
        assert!(!dir.path().join(BOOTSTRAP_TOKEN_FILE).exists());
        Ok(())
    }

    #[test]
    fn claim_is_exclusive_until_released() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bootstrap = BootstrapToken::initialize(dir.path(), false, false);
        let claim = bootstrap.claim();
        assert!(claim.is_some());
        assert!(bootstrap.claim().is_none());

        drop(claim);
        assert!(bootstrap.is_active());
        assert!(dir.path().join(BOOTSTRAP_TOKEN_FILE).exists());

        let claim = bootstrap
            .claim()
            .ok_or_else(|| anyhow::anyhow!("token should be claimable again"))?;
        claim.commit();
        assert!(!bootstrap.is_active());
        assert!(bootstrap.claim().is_none());
        assert!(!dir.path().join(BOOTSTRAP_TOKEN_FILE).exists());
        Ok(())
    }

    #[test]
    fn provided_token_prefers_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(provided_token(&headers, br#"{"token":" abc "}"#).as_deref(), Some("abc"));
        headers.insert(BOOTSTRAP_TOKEN_HEADER, HeaderValue::from_static("hdr"));
        assert_eq!(provided_token(&headers, br#"{"token":"abc"}"#).as_deref(), Some("hdr"));
        assert_eq!(provided_token(&HeaderMap::new(), b""), None);
    }
}
