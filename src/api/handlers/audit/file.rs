//! Signed, append-only JSON-lines audit log.
//!
//! Each line carries `signature = sha256(previous_signature || event_json)`
//! where `event_json` is the event serialized without its signature. Editing
//! or removing a line breaks verification for that event and its successor.

use std::{
    fs::{self, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
};
use tracing::{debug, warn};

use super::{
    logger::{AuditLogger, PersistentLogger, TenantLoggerFactory},
    types::{AuditError, AuditEvent, AuditFilter},
    webhooks::WebhookSender,
};
use crate::api::handlers::{
    auth::utils::sha256_hex,
    persist::{StoreError, load_json, save_json},
    tenant::MultiTenantPersistence,
};

pub const AUDIT_DIR: &str = "audit";
pub const AUDIT_LOG_FILE: &str = "audit.jsonl";
pub const WEBHOOKS_FILE: &str = "webhooks.json";

fn sign(previous: &str, event: &AuditEvent) -> Result<String, AuditError> {
    let unsigned = AuditEvent {
        signature: None,
        ..event.clone()
    };
    let body = serde_json::to_string(&unsigned)?;
    Ok(sha256_hex(&format!("{previous}{body}")))
}

pub struct FileAuditLogger {
    log_path: PathBuf,
    webhooks_path: PathBuf,
    last_signature: Mutex<String>,
    webhook_urls: RwLock<Vec<String>>,
    sender: Option<WebhookSender>,
}

impl std::fmt::Debug for FileAuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditLogger")
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}

impl FileAuditLogger {
    /// Open (or create) the log under `dir` and pick up the signature chain.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the log read.
    pub fn open(dir: &Path, sender: Option<WebhookSender>) -> Result<Self, AuditError> {
        fs::create_dir_all(dir).map_err(|err| StoreError::io(dir, err))?;
        let logger = Self {
            log_path: dir.join(AUDIT_LOG_FILE),
            webhooks_path: dir.join(WEBHOOKS_FILE),
            last_signature: Mutex::new(String::new()),
            webhook_urls: RwLock::new(Vec::new()),
            sender,
        };
        let last = logger
            .read_events()?
            .last()
            .and_then(|event| event.signature.clone())
            .unwrap_or_default();
        *logger
            .last_signature
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = last;

        let urls = match load_json::<Vec<String>>(&logger.webhooks_path) {
            Ok(urls) => urls.unwrap_or_default(),
            Err(err) => {
                warn!("Ignoring unreadable audit webhook configuration: {err}");
                Vec::new()
            }
        };
        *logger
            .webhook_urls
            .write()
            .unwrap_or_else(PoisonError::into_inner) = urls;
        Ok(logger)
    }

    /// All stored events in write order. Malformed lines are skipped.
    fn read_events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let file = match fs::File::open(&self.log_path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&self.log_path, err).into()),
        };
        let mut events = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| StoreError::io(&self.log_path, err))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) => events.push(event),
                Err(err) => warn!(line = number + 1, "Skipping malformed audit line: {err}"),
            }
        }
        Ok(events)
    }

    fn append(&self, line: &str) -> Result<(), AuditError> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.log_path)
            .map_err(|err| StoreError::io(&self.log_path, err))?;
        writeln!(file, "{line}").map_err(|err| StoreError::io(&self.log_path, err))?;
        Ok(())
    }
}

impl AuditLogger for FileAuditLogger {
    fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let signed = {
            let mut last = self
                .last_signature
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let signature = sign(&last, event)?;
            let signed = AuditEvent {
                signature: Some(signature.clone()),
                ..event.clone()
            };
            self.append(&serde_json::to_string(&signed)?)?;
            *last = signature;
            signed
        };
        if let Some(sender) = &self.sender {
            sender.deliver(&self.webhook_urls(), &signed);
        }
        Ok(())
    }

    fn persistent(&self) -> Option<&dyn PersistentLogger> {
        Some(self)
    }
}

impl PersistentLogger for FileAuditLogger {
    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self
            .read_events()?
            .into_iter()
            .rev()
            .filter(|event| filter.matches(event))
            .skip(filter.offset)
            .take(filter.effective_limit())
            .collect())
    }

    fn count(&self, filter: &AuditFilter) -> Result<usize, AuditError> {
        Ok(self
            .read_events()?
            .iter()
            .filter(|event| filter.matches(event))
            .count())
    }

    fn verify_signature(&self, event: &AuditEvent) -> Result<bool, AuditError> {
        let Some(signature) = event.signature.as_deref() else {
            return Ok(false);
        };
        let events = self.read_events()?;
        let Some(position) = events.iter().position(|stored| stored.id == event.id) else {
            return Ok(false);
        };
        let previous = position
            .checked_sub(1)
            .and_then(|index| events[index].signature.clone())
            .unwrap_or_default();
        Ok(sign(&previous, event)? == signature)
    }

    fn webhook_urls(&self) -> Vec<String> {
        self.webhook_urls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_webhook_urls(&self, urls: Vec<String>) -> Result<(), AuditError> {
        let mut current = self
            .webhook_urls
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        save_json(&self.webhooks_path, &urls)?;
        debug!(count = urls.len(), "Audit webhook URLs updated");
        *current = urls;
        Ok(())
    }
}

/// Opens a [`FileAuditLogger`] under each org's directory.
#[derive(Debug)]
pub struct FileLoggerFactory {
    persistence: Arc<MultiTenantPersistence>,
    sender: Option<WebhookSender>,
}

impl FileLoggerFactory {
    #[must_use]
    pub fn new(persistence: Arc<MultiTenantPersistence>, sender: Option<WebhookSender>) -> Self {
        Self {
            persistence,
            sender,
        }
    }
}

impl TenantLoggerFactory for FileLoggerFactory {
    fn create(&self, org_id: &str) -> Result<Arc<dyn AuditLogger>, AuditError> {
        if !self.persistence.org_exists(org_id) {
            return Err(AuditError::Tenant {
                org_id: org_id.to_string(),
                reason: "organization not found".to_string(),
            });
        }
        let dir = self
            .persistence
            .org_dir(org_id)
            .map_err(|err| AuditError::Tenant {
                org_id: org_id.to_string(),
                reason: err.to_string(),
            })?
            .join(AUDIT_DIR);
        Ok(Arc::new(FileAuditLogger::open(&dir, self.sender.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn logger(dir: &Path) -> Result<FileAuditLogger> {
        Ok(FileAuditLogger::open(dir, None)?)
    }

    #[test]
    fn events_are_chained_and_verifiable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = logger(dir.path())?;
        log.log(&AuditEvent::new("login").user("alice").success(true))?;
        log.log(&AuditEvent::new("logout").user("alice").success(true))?;

        let events = log.query(&AuditFilter::default())?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "logout");
        for event in &events {
            assert!(log.verify_signature(event)?);
        }

        let mut tampered = events[1].clone();
        tampered.user = "mallory".to_string();
        assert!(!log.verify_signature(&tampered)?);
        Ok(())
    }

    #[test]
    fn chain_continues_after_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        logger(dir.path())?.log(&AuditEvent::new("login"))?;
        let reopened = logger(dir.path())?;
        reopened.log(&AuditEvent::new("logout"))?;
        let events = reopened.query(&AuditFilter::default())?;
        assert!(events.iter().all(|e| reopened.verify_signature(e).unwrap_or(false)));
        Ok(())
    }

    #[test]
    fn query_filters_and_pages() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = logger(dir.path())?;
        for i in 0..5 {
            log.log(&AuditEvent::new("login").user(&format!("u{i}")).success(i % 2 == 0))?;
        }
        let filter = AuditFilter {
            success: Some(true),
            ..AuditFilter::default()
        };
        assert_eq!(log.count(&filter)?, 3);
        let page = log.query(&AuditFilter {
            limit: Some(2),
            offset: 1,
            ..AuditFilter::default()
        })?;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].user, "u3");
        Ok(())
    }

    #[test]
    fn export_counts_events() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = logger(dir.path())?;
        log.log(&AuditEvent::new("login").success(true))?;
        let export = log.export(&AuditFilter::default(), super::super::types::ExportFormat::Json)?;
        assert_eq!(export.event_count, 1);
        assert!(export.filename.ends_with(".json"));
        Ok(())
    }

    #[test]
    fn webhook_urls_persist() -> Result<()> {
        let dir = tempfile::tempdir()?;
        logger(dir.path())?.set_webhook_urls(vec!["https://example.com/hook".to_string()])?;
        assert_eq!(
            logger(dir.path())?.webhook_urls(),
            vec!["https://example.com/hook".to_string()]
        );
        Ok(())
    }

    #[test]
    fn malformed_lines_are_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = logger(dir.path())?;
        log.log(&AuditEvent::new("login"))?;
        log.append("not json")?;
        assert_eq!(log.count(&AuditFilter::default())?, 1);
        Ok(())
    }
}
