//! Local credentials (single configured user).
//!
//! Passwords are Argon2id PHC strings. Credentials set through quick setup are
//! persisted in `<dataDir>/auth.json`.

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};
use tracing::warn;

use super::utils::constant_time_eq;
use crate::api::handlers::persist::{StoreError, load_json, save_json};

pub const AUTH_FILE: &str = "auth.json";
pub const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("password must be at least {MIN_PASSWORD_LENGTH} characters")]
    TooShort,
    #[error("failed to hash password")]
    Hash,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hash a password into an Argon2id PHC string.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| PasswordError::Hash)
}

/// [`hash_password`] on the blocking pool.
///
/// # Errors
/// Returns an error if hashing fails or the task is cancelled.
pub async fn hash_password_blocking(password: String) -> Result<String, PasswordError> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|_| PasswordError::Hash)?
}

/// Verify a password against a PHC string. Malformed hashes never match.
#[must_use]
pub fn verify_password(password: &str, phc: &str) -> bool {
    PasswordHash::new(phc).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

/// Whether a configured value already looks like a PHC hash.
#[must_use]
pub fn is_phc_hash(value: &str) -> bool {
    value.starts_with("$argon2") && PasswordHash::new(value).is_ok()
}

/// Minimal complexity rule for new passwords.
///
/// # Errors
/// Returns [`PasswordError::TooShort`] below the minimum length.
pub fn validate_complexity(password: &str) -> Result<(), PasswordError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(PasswordError::TooShort);
    }
    Ok(())
}

#[derive(Clone)]
pub struct LocalCredentials {
    pub username: String,
    password_hash: SecretString,
}

impl std::fmt::Debug for LocalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCredentials")
            .field("username", &self.username)
            .field("password_hash", &"[REDACTED]")
            .finish()
    }
}

impl LocalCredentials {
    /// Accept either a PHC hash or a plain password (hashed here, with a warning).
    ///
    /// # Errors
    /// Returns an error if a plain password cannot be hashed.
    pub fn from_config(username: &str, password: &SecretString) -> Result<Self, PasswordError> {
        let value = password.expose_secret();
        let hash = if is_phc_hash(value) {
            value.to_string()
        } else {
            warn!("Configured password is not hashed; hashing it in memory");
            hash_password(value)?
        };
        Ok(Self {
            username: username.to_string(),
            password_hash: SecretString::from(hash),
        })
    }

    #[must_use]
    pub fn from_hash(username: &str, hash: String) -> Self {
        Self {
            username: username.to_string(),
            password_hash: SecretString::from(hash),
        }
    }

    /// Check both username and password; the password is always verified.
    #[must_use]
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let user_match = constant_time_eq(&self.username, username);
        let pass_match = verify_password(password, self.password_hash.expose_secret());
        user_match && pass_match
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredentials {
    username: String,
    password_hash: String,
}

/// Runtime-mutable local credentials, optionally backed by `auth.json`.
#[derive(Debug, Default)]
pub struct CredentialStore {
    path: Option<PathBuf>,
    current: RwLock<Option<LocalCredentials>>,
}

impl CredentialStore {
    /// Use CLI credentials when given, otherwise load `auth.json`.
    ///
    /// # Errors
    /// Returns an error if `auth.json` is unreadable or the CLI password cannot
    /// be hashed.
    pub fn open(
        data_dir: &Path,
        configured: Option<(&str, &SecretString)>,
    ) -> Result<Self, PasswordError> {
        let path = data_dir.join(AUTH_FILE);
        let current = match configured {
            Some((user, pass)) => Some(LocalCredentials::from_config(user, pass)?),
            None => load_json::<StoredCredentials>(&path)?
                .filter(|stored| !stored.username.is_empty() && is_phc_hash(&stored.password_hash))
                .map(|stored| LocalCredentials::from_hash(&stored.username, stored.password_hash)),
        };
        Ok(Self {
            path: Some(path),
            current: RwLock::new(current),
        })
    }

    #[must_use]
    pub fn in_memory(credentials: Option<LocalCredentials>) -> Self {
        Self {
            path: None,
            current: RwLock::new(credentials),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<LocalCredentials> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Replace the credentials with an already hashed password and persist them.
    ///
    /// # Errors
    /// Returns an error if `hash` is not a PHC string or persistence fails;
    /// nothing changes then.
    pub fn set_hash(&self, username: &str, hash: String) -> Result<(), PasswordError> {
        if !is_phc_hash(&hash) {
            return Err(PasswordError::Hash);
        }
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = &self.path {
            save_json(
                path,
                &StoredCredentials {
                    username: username.to_string(),
                    password_hash: hash.clone(),
                },
            )?;
        }
        *current = Some(LocalCredentials::from_hash(username, hash));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn hash_and_verify() -> Result<()> {
        let hash = hash_password("Password!1")?;
        assert!(is_phc_hash(&hash));
        assert!(verify_password("Password!1", &hash));
        assert!(!verify_password("Password!2", &hash));
        assert!(!verify_password("Password!1", "not-a-hash"));
        Ok(())
    }

    #[test]
    fn plain_config_password_is_hashed() -> Result<()> {
        let creds = LocalCredentials::from_config("alice", &SecretString::from("Password!1"))?;
        assert!(creds.verify("alice", "Password!1"));
        assert!(!creds.verify("bob", "Password!1"));
        assert!(!creds.verify("alice", "wrong"));
        assert!(!format!("{creds:?}").contains("argon2"));
        Ok(())
    }

    #[test]
    fn complexity_requires_minimum_length() {
        assert!(validate_complexity("short").is_err());
        assert!(validate_complexity("long-enough").is_ok());
    }

    #[test]
    fn store_persists_and_reloads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::open(dir.path(), None)?;
        assert!(!store.is_configured());
        store.set_hash("alice", hash_password("Password!1")?)?;
        assert!(store.is_configured());

        let reloaded = CredentialStore::open(dir.path(), None)?;
        let creds = reloaded.get().ok_or_else(|| anyhow::anyhow!("missing credentials"))?;
        assert!(creds.verify("alice", "Password!1"));

        let content = std::fs::read_to_string(dir.path().join(AUTH_FILE))?;
        assert!(!content.contains("Password!1"));
        Ok(())
    }

    #[test]
    fn cli_credentials_take_precedence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        CredentialStore::open(dir.path(), None)?.set_hash("stored", hash_password("Password!1")?)?;
        let secret = SecretString::from("Other!Pass1");
        let store = CredentialStore::open(dir.path(), Some(("cli", &secret)))?;
        let creds = store.get().ok_or_else(|| anyhow::anyhow!("missing credentials"))?;
        assert_eq!(creds.username, "cli");
        Ok(())
    }

    #[tokio::test]
    async fn blocking_hash_verifies() -> Result<()> {
        let hash = hash_password_blocking("Password!1".to_string()).await?;
        assert!(verify_password("Password!1", &hash));
        Ok(())
    }

    #[test]
    fn failed_write_keeps_previous_credentials() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::open(dir.path(), None)?;
        std::fs::create_dir(dir.path().join(AUTH_FILE))?;
        assert!(store.set_hash("alice", hash_password("Password!1")?).is_err());
        assert!(!store.is_configured());
        assert!(store.set_hash("alice", "plain".to_string()).is_err());
        Ok(())
    }
}
