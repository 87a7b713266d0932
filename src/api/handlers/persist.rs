//! Atomic JSON persistence shared by the file-backed stores.
//!
//! Every write goes to `<file>.tmp`, is flushed, then renamed over the target so
//! a reader never observes a partially written file.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::Path,
};

use serde::{Serialize, de::DeserializeOwned};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Serialization error on {path}: {source}")]
    Serde {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Random source failure: {0}")]
    Random(String),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Write bytes to `path` atomically with owner-only permissions.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp).map_err(|err| StoreError::io(&tmp, err))?;
        file.write_all(bytes)
            .map_err(|err| StoreError::io(&tmp, err))?;
        file.sync_all().map_err(|err| StoreError::io(&tmp, err))?;
    }
    fs::rename(&tmp, path).map_err(|err| StoreError::io(path, err))
}

/// Serialize `value` as pretty JSON and write it atomically.
pub(crate) fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serde {
        path: path.display().to_string(),
        source,
    })?;
    write_atomic(path, &bytes)
}

/// Read a JSON file. A missing file yields `Ok(None)`.
pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Serde {
                path: path.display().to_string(),
                source,
            }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}
