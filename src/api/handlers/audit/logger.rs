//! Audit logger seams and the tenant-aware dispatcher.
//!
//! The console logger is always present. Persistent back-ends additionally
//! implement [`PersistentLogger`]; handlers use its presence to decide whether
//! query, verification and export are available.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{info, warn};

use super::types::{AuditError, AuditEvent, AuditFilter, ExportFormat, ExportResult, export_events};

pub trait AuditLogger: Send + Sync {
    /// # Errors
    /// Returns an error if the event could not be recorded.
    fn log(&self, event: &AuditEvent) -> Result<(), AuditError>;

    /// Query/verify/export capabilities, when the back-end has them.
    fn persistent(&self) -> Option<&dyn PersistentLogger> {
        None
    }

    /// # Errors
    /// Returns an error if buffered state cannot be flushed.
    fn close(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

pub trait PersistentLogger: Send + Sync {
    /// Matching events, newest first, paged by the filter.
    ///
    /// # Errors
    /// Returns an error if the backing store cannot be read.
    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError>;

    /// # Errors
    /// Returns an error if the backing store cannot be read.
    fn count(&self, filter: &AuditFilter) -> Result<usize, AuditError>;

    /// Whether the stored signature chain still holds for `event`.
    ///
    /// # Errors
    /// Returns [`AuditError::Unsupported`] when the back-end does not sign events.
    fn verify_signature(&self, event: &AuditEvent) -> Result<bool, AuditError>;

    /// Back-ends without a signature chain return `false`.
    fn can_verify(&self) -> bool {
        true
    }

    fn webhook_urls(&self) -> Vec<String>;

    /// # Errors
    /// Returns an error if the URLs cannot be persisted.
    fn set_webhook_urls(&self, urls: Vec<String>) -> Result<(), AuditError>;

    /// # Errors
    /// Returns an error if the query or encoding fails.
    fn export(&self, filter: &AuditFilter, format: ExportFormat) -> Result<ExportResult, AuditError> {
        let events = self.query(&filter.unpaged())?;
        export_events(&events, format, chrono::Utc::now())
    }
}

/// Writes events to the tracing pipeline under the `audit` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleLogger;

impl AuditLogger for ConsoleLogger {
    fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        if event.success {
            info!(
                target: "audit",
                event = %event.event,
                user = %event.user,
                ip = %event.ip,
                path = %event.path,
                success = event.success,
                details = %event.details,
                "audit"
            );
        } else {
            warn!(
                target: "audit",
                event = %event.event,
                user = %event.user,
                ip = %event.ip,
                path = %event.path,
                success = event.success,
                details = %event.details,
                "audit"
            );
        }
        Ok(())
    }
}

/// Builds the logger for one org on first use.
pub trait TenantLoggerFactory: Send + Sync {
    /// # Errors
    /// Returns an error if the org's logger cannot be opened.
    fn create(&self, org_id: &str) -> Result<Arc<dyn AuditLogger>, AuditError>;
}

/// Lazily created, cached per-org loggers.
pub struct TenantLoggerManager {
    factory: Arc<dyn TenantLoggerFactory>,
    loggers: RwLock<HashMap<String, Arc<dyn AuditLogger>>>,
}

impl std::fmt::Debug for TenantLoggerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantLoggerManager")
            .field("tenants", &self.len())
            .finish_non_exhaustive()
    }
}

impl TenantLoggerManager {
    #[must_use]
    pub fn new(factory: Arc<dyn TenantLoggerFactory>) -> Self {
        Self {
            factory,
            loggers: RwLock::new(HashMap::new()),
        }
    }

    /// Create-or-return the logger for `org_id`.
    ///
    /// # Errors
    /// Returns an error if the factory fails.
    pub fn logger(&self, org_id: &str) -> Result<Arc<dyn AuditLogger>, AuditError> {
        if let Some(logger) = self
            .loggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(org_id)
        {
            return Ok(Arc::clone(logger));
        }
        let mut loggers = self.loggers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(logger) = loggers.get(org_id) {
            return Ok(Arc::clone(logger));
        }
        let logger = self.factory.create(org_id)?;
        loggers.insert(org_id.to_string(), Arc::clone(&logger));
        Ok(logger)
    }

    /// Close and evict one org's logger.
    pub fn remove(&self, org_id: &str) {
        let removed = self
            .loggers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(org_id);
        if let Some(logger) = removed {
            if let Err(err) = logger.close() {
                warn!(org_id, "Failed to close tenant audit logger: {err}");
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.loggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        let drained: Vec<_> = self
            .loggers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (org_id, logger) in drained {
            if let Err(err) = logger.close() {
                warn!(org_id, "Failed to close tenant audit logger: {err}");
            }
        }
    }
}

/// Entry point for emitting audit events.
pub struct AuditDispatcher {
    global: Arc<dyn AuditLogger>,
    tenants: RwLock<Option<Arc<TenantLoggerManager>>>,
}

impl std::fmt::Debug for AuditDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditDispatcher")
            .field("persistent", &self.global.persistent().is_some())
            .finish_non_exhaustive()
    }
}

impl AuditDispatcher {
    #[must_use]
    pub fn new(global: Arc<dyn AuditLogger>) -> Self {
        Self {
            global,
            tenants: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn console() -> Self {
        Self::new(Arc::new(ConsoleLogger))
    }

    pub fn set_tenant_manager(&self, manager: Arc<TenantLoggerManager>) {
        *self.tenants.write().unwrap_or_else(PoisonError::into_inner) = Some(manager);
    }

    fn tenant_manager(&self) -> Option<Arc<TenantLoggerManager>> {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn global(&self) -> Arc<dyn AuditLogger> {
        Arc::clone(&self.global)
    }

    /// Record through the global logger. Failures are logged, never returned.
    pub fn log(&self, event: AuditEvent) {
        if let Err(err) = self.global.log(&event) {
            warn!(event = %event.event, "Failed to write audit event: {err}");
        }
    }

    /// Record through the org's logger, falling back to the global one.
    pub fn log_for_tenant(&self, org_id: &str, event: AuditEvent) {
        if let Some(manager) = self.tenant_manager() {
            match manager.logger(org_id).and_then(|logger| logger.log(&event)) {
                Ok(()) => return,
                Err(err) => {
                    warn!(org_id, event = %event.event, "Tenant audit logging failed, using global logger: {err}");
                }
            }
        }
        self.log(event);
    }

    /// Logger that serves queries for `org_id`.
    #[must_use]
    pub fn logger_for(&self, org_id: &str) -> Arc<dyn AuditLogger> {
        self.tenant_manager()
            .and_then(|manager| match manager.logger(org_id) {
                Ok(logger) => Some(logger),
                Err(err) => {
                    warn!(org_id, "Tenant audit logger unavailable: {err}");
                    None
                }
            })
            .unwrap_or_else(|| self.global())
    }

    pub fn close(&self) {
        if let Some(manager) = self.tenant_manager() {
            manager.close();
        }
        if let Err(err) = self.global.close() {
            warn!("Failed to close audit logger: {err}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory logger for tests.
    #[derive(Default)]
    pub(crate) struct MemoryLogger {
        pub(crate) events: Mutex<Vec<AuditEvent>>,
        pub(crate) fail: bool,
    }

    impl MemoryLogger {
        pub(crate) fn events(&self) -> Vec<AuditEvent> {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    impl AuditLogger for MemoryLogger {
        fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
            if self.fail {
                return Err(AuditError::Unsupported);
            }
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
            Ok(())
        }
    }

    struct Factory {
        loggers: Mutex<HashMap<String, Arc<MemoryLogger>>>,
        fail_for: Option<String>,
    }

    impl TenantLoggerFactory for Factory {
        fn create(&self, org_id: &str) -> Result<Arc<dyn AuditLogger>, AuditError> {
            let logger = Arc::new(MemoryLogger {
                fail: self.fail_for.as_deref() == Some(org_id),
                ..MemoryLogger::default()
            });
            self.loggers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(org_id.to_string(), Arc::clone(&logger));
            Ok(logger)
        }
    }

    #[test]
    fn tenant_events_are_routed() {
        let global = Arc::new(MemoryLogger::default());
        let factory = Arc::new(Factory {
            loggers: Mutex::new(HashMap::new()),
            fail_for: None,
        });
        let dispatcher = AuditDispatcher::new(global.clone());
        dispatcher.set_tenant_manager(Arc::new(TenantLoggerManager::new(factory.clone())));

        dispatcher.log_for_tenant("acme", AuditEvent::new("login").success(true));
        dispatcher.log_for_tenant("acme", AuditEvent::new("logout").success(true));

        let acme = factory
            .loggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get("acme")
            .cloned();
        assert_eq!(acme.map(|l| l.events().len()), Some(2));
        assert!(global.events().is_empty());
    }

    #[test]
    fn tenant_failure_falls_back_to_global() {
        let global = Arc::new(MemoryLogger::default());
        let factory = Arc::new(Factory {
            loggers: Mutex::new(HashMap::new()),
            fail_for: Some("beta".to_string()),
        });
        let dispatcher = AuditDispatcher::new(global.clone());
        dispatcher.set_tenant_manager(Arc::new(TenantLoggerManager::new(factory)));
        dispatcher.log_for_tenant("beta", AuditEvent::new("login"));
        assert_eq!(global.events().len(), 1);
    }

    #[test]
    fn without_manager_everything_goes_global() {
        let global = Arc::new(MemoryLogger::default());
        let dispatcher = AuditDispatcher::new(global.clone());
        dispatcher.log_for_tenant("acme", AuditEvent::new("login"));
        dispatcher.log(AuditEvent::new("logout"));
        assert_eq!(global.events().len(), 2);
        assert!(dispatcher.logger_for("acme").persistent().is_none());
    }

    #[test]
    fn manager_caches_and_removes() -> anyhow::Result<()> {
        let factory = Arc::new(Factory {
            loggers: Mutex::new(HashMap::new()),
            fail_for: None,
        });
        let manager = TenantLoggerManager::new(factory);
        let first = manager.logger("acme")?;
        let second = manager.logger("acme")?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
        manager.remove("acme");
        assert!(manager.is_empty());
        Ok(())
    }
}
