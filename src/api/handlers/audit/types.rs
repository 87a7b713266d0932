use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::api::handlers::persist::StoreError;

pub const DEFAULT_QUERY_LIMIT: usize = 100;
pub const MAX_QUERY_LIMIT: usize = 1000;

/// A security-relevant event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub path: String,
    pub success: bool,
    #[serde(default)]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(event: &str) -> Self {
        Self {
            id: Ulid::new().to_string(),
            timestamp: Utc::now(),
            event: event.to_string(),
            user: String::new(),
            ip: String::new(),
            path: String::new(),
            success: false,
            details: String::new(),
            signature: None,
        }
    }

    #[must_use]
    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    #[must_use]
    pub fn ip(mut self, ip: &str) -> Self {
        self.ip = ip.to_string();
        self
    }

    #[must_use]
    pub fn path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    #[must_use]
    pub fn success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    #[must_use]
    pub fn details(mut self, details: &str) -> Self {
        self.details = details.to_string();
        self
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode audit event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("tenant audit logger unavailable for {org_id}: {reason}")]
    Tenant { org_id: String, reason: String },
    #[error("operation not supported by this audit backend")]
    Unsupported,
}

/// Query filter for persistent back-ends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub id: Option<String>,
    pub event: Option<String>,
    pub user: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl AuditFilter {
    #[must_use]
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.id.as_ref().is_none_or(|id| *id == event.id)
            && self.event.as_ref().is_none_or(|name| *name == event.event)
            && self.user.as_ref().is_none_or(|user| *user == event.user)
            && self.start_time.is_none_or(|start| event.timestamp >= start)
            && self.end_time.is_none_or(|end| event.timestamp <= end)
            && self.success.is_none_or(|success| success == event.success)
    }

    /// Clamped page size.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            Some(0) | None => DEFAULT_QUERY_LIMIT,
            Some(limit) => limit.min(MAX_QUERY_LIMIT),
        }
    }

    /// Same filter without paging, for counts and exports.
    #[must_use]
    pub fn unpaged(&self) -> Self {
        Self {
            limit: Some(MAX_QUERY_LIMIT),
            offset: 0,
            ..self.clone()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }

    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json; charset=utf-8",
            Self::Csv => "text/csv; charset=utf-8",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExportResult {
    pub data: Vec<u8>,
    pub filename: String,
    pub content_type: &'static str,
    pub event_count: usize,
}

/// Aggregate numbers over a filtered event set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub total_events: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub event_types: std::collections::BTreeMap<String, usize>,
}

impl AuditSummary {
    #[must_use]
    pub fn from_events(events: &[AuditEvent]) -> Self {
        let mut summary = Self {
            total_events: events.len(),
            ..Self::default()
        };
        for event in events {
            if event.success {
                summary.success_count += 1;
            } else {
                summary.failure_count += 1;
            }
            *summary.event_types.entry(event.event.clone()).or_default() += 1;
        }
        summary
    }
}

const CSV_HEADER: &str = "id,timestamp,event,user,ip,path,success,details,signature";

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render events for download.
///
/// # Errors
/// Returns an error if JSON encoding fails.
pub fn export_events(
    events: &[AuditEvent],
    format: ExportFormat,
    now: DateTime<Utc>,
) -> Result<ExportResult, AuditError> {
    let data = match format {
        ExportFormat::Json => serde_json::to_vec_pretty(events)?,
        ExportFormat::Csv => {
            let mut out = String::from(CSV_HEADER);
            out.push('\n');
            for event in events {
                let row = [
                    csv_field(&event.id),
                    event.timestamp.to_rfc3339(),
                    csv_field(&event.event),
                    csv_field(&event.user),
                    csv_field(&event.ip),
                    csv_field(&event.path),
                    event.success.to_string(),
                    csv_field(&event.details),
                    csv_field(event.signature.as_deref().unwrap_or_default()),
                ];
                out.push_str(&row.join(","));
                out.push('\n');
            }
            out.into_bytes()
        }
    };
    Ok(ExportResult {
        data,
        filename: format!(
            "audit-log-{}.{}",
            now.format("%Y%m%d-%H%M%S"),
            format.extension()
        ),
        content_type: format.content_type(),
        event_count: events.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::{Duration, TimeZone};

    fn event(name: &str, user: &str, success: bool) -> AuditEvent {
        AuditEvent::new(name).user(user).success(success)
    }

    #[test]
    fn filter_matches_fields() -> Result<()> {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().ok_or_else(|| anyhow::anyhow!("time"))?;
        let login = event("login", "alice", true).at(now);
        let filter = AuditFilter {
            event: Some("login".to_string()),
            user: Some("alice".to_string()),
            start_time: Some(now - Duration::hours(1)),
            end_time: Some(now),
            success: Some(true),
            ..AuditFilter::default()
        };
        assert!(filter.matches(&login));
        assert!(!filter.matches(&event("logout", "alice", true).at(now)));
        assert!(!filter.matches(&event("login", "alice", false).at(now)));
        assert!(!filter.matches(&login.clone().at(now + Duration::seconds(1))));
        Ok(())
    }

    #[test]
    fn limit_is_clamped() {
        let mut filter = AuditFilter::default();
        assert_eq!(filter.effective_limit(), DEFAULT_QUERY_LIMIT);
        filter.limit = Some(5000);
        assert_eq!(filter.effective_limit(), MAX_QUERY_LIMIT);
        filter.limit = Some(10);
        assert_eq!(filter.effective_limit(), 10);
    }

    #[test]
    fn csv_export_escapes_fields() -> Result<()> {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().ok_or_else(|| anyhow::anyhow!("time"))?;
        let events = vec![event("login", "alice", false).details("bad \"password\", again")];
        let result = export_events(&events, ExportFormat::Csv, now)?;
        let text = String::from_utf8(result.data)?;
        assert!(text.starts_with(CSV_HEADER));
        assert!(text.contains("\"bad \"\"password\"\", again\""));
        assert_eq!(result.filename, "audit-log-20260102-030405.csv");
        assert_eq!(result.content_type, "text/csv; charset=utf-8");
        assert_eq!(result.event_count, 1);
        Ok(())
    }

    #[test]
    fn summary_counts_outcomes() {
        let events = vec![
            event("login", "a", true),
            event("login", "b", false),
            event("logout", "a", true),
        ];
        let summary = AuditSummary::from_events(&events);
        assert_eq!(summary.total_events, 3);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.event_types.get("login"), Some(&2));
    }

    #[test]
    fn export_format_parse() {
        assert_eq!(ExportFormat::parse(""), Some(ExportFormat::Json));
        assert_eq!(ExportFormat::parse("CSV"), Some(ExportFormat::Csv));
        assert_eq!(ExportFormat::parse("xml"), None);
    }
}
