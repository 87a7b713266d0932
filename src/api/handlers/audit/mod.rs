//! Audit events, loggers and the HTTP surface over them.

pub mod file;
pub mod handlers;
mod logger;
mod types;
pub mod webhooks;

pub use file::{FileAuditLogger, FileLoggerFactory};
pub use logger::{
    AuditDispatcher, AuditLogger, ConsoleLogger, PersistentLogger, TenantLoggerFactory,
    TenantLoggerManager,
};
pub use types::{
    AuditError, AuditEvent, AuditFilter, AuditSummary, DEFAULT_QUERY_LIMIT, ExportFormat,
    ExportResult, MAX_QUERY_LIMIT, export_events,
};
pub use webhooks::{WebhookError, WebhookSender};
