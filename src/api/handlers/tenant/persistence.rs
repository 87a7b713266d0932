//! Per-org directories, configuration and monitor handles.
//!
//! Layout: the default org lives directly in `<dataDir>`; every other org gets
//! `<dataDir>/orgs/<orgID>/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, info};

use super::{DEFAULT_ORG_ID, TenantError, is_valid_org_id};
use crate::api::handlers::persist::{StoreError, load_json};

pub const ORGS_DIR: &str = "orgs";
pub const MONITOR_CONFIG_FILE: &str = "monitor.json";

/// Monitored endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredNode {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub kind: String,
}

/// Monitoring configuration. Each tenant owns its own copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default)]
    pub nodes: Vec<MonitoredNode>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            nodes: Vec::new(),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct MultiTenantPersistence {
    data_dir: PathBuf,
    base: MonitorConfig,
}

impl MultiTenantPersistence {
    #[must_use]
    pub fn new(data_dir: &Path, base: MonitorConfig) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            base,
        }
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory that holds `org_id`'s files. Nothing is created.
    ///
    /// # Errors
    /// Returns [`TenantError::InvalidOrgId`] for IDs unsafe as path components.
    pub fn org_dir(&self, org_id: &str) -> Result<PathBuf, TenantError> {
        if !is_valid_org_id(org_id) {
            return Err(TenantError::InvalidOrgId(org_id.to_string()));
        }
        if org_id == DEFAULT_ORG_ID {
            return Ok(self.data_dir.clone());
        }
        Ok(self.data_dir.join(ORGS_DIR).join(org_id))
    }

    /// # Errors
    /// Returns an error for invalid IDs or when the directory cannot be created.
    pub fn create_org_dir(&self, org_id: &str) -> Result<PathBuf, TenantError> {
        let dir = self.org_dir(org_id)?;
        fs::create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
                .map_err(|err| StoreError::io(&dir, err))?;
        }
        Ok(dir)
    }

    /// The default org always exists; others once their directory does.
    #[must_use]
    pub fn org_exists(&self, org_id: &str) -> bool {
        org_id == DEFAULT_ORG_ID || self.org_dir(org_id).is_ok_and(|dir| dir.is_dir())
    }

    /// Deep copy of the base configuration, replaced by the org's own
    /// `monitor.json` when present.
    ///
    /// # Errors
    /// Returns an error for unknown orgs or an unreadable config file.
    pub fn load_config(&self, org_id: &str) -> Result<MonitorConfig, TenantError> {
        if !self.org_exists(org_id) {
            return Err(TenantError::UnknownOrg(org_id.to_string()));
        }
        let path = self.org_dir(org_id)?.join(MONITOR_CONFIG_FILE);
        Ok(load_json::<MonitorConfig>(&path)?.unwrap_or_else(|| self.base.clone()))
    }
}

/// Monitoring handle bound to one org.
#[derive(Debug)]
pub struct TenantMonitor {
    org_id: String,
    config: MonitorConfig,
    started_at: DateTime<Utc>,
}

impl TenantMonitor {
    #[must_use]
    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn stop(&self) {
        debug!(org_id = %self.org_id, "Tenant monitor stopped");
    }
}

/// Lazily created, cached monitor handles.
#[derive(Debug)]
pub struct TenantMonitors {
    persistence: Arc<MultiTenantPersistence>,
    monitors: RwLock<HashMap<String, Arc<TenantMonitor>>>,
}

impl TenantMonitors {
    #[must_use]
    pub fn new(persistence: Arc<MultiTenantPersistence>) -> Self {
        Self {
            persistence,
            monitors: RwLock::new(HashMap::new()),
        }
    }

    /// Create-or-return the monitor for `org_id`.
    ///
    /// # Errors
    /// Returns an error for unknown orgs or unreadable configuration.
    pub fn get(&self, org_id: &str) -> Result<Arc<TenantMonitor>, TenantError> {
        if let Some(monitor) = self
            .monitors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(org_id)
        {
            return Ok(Arc::clone(monitor));
        }
        let mut monitors = self.monitors.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(monitor) = monitors.get(org_id) {
            return Ok(Arc::clone(monitor));
        }
        let monitor = Arc::new(TenantMonitor {
            org_id: org_id.to_string(),
            config: self.persistence.load_config(org_id)?,
            started_at: Utc::now(),
        });
        info!(org_id, nodes = monitor.config.nodes.len(), "Started tenant monitor");
        monitors.insert(org_id.to_string(), Arc::clone(&monitor));
        Ok(monitor)
    }

    pub fn remove(&self, org_id: &str) {
        let removed = self
            .monitors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(org_id);
        if let Some(monitor) = removed {
            monitor.stop();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.monitors
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
            .monitors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, monitor) in drained {
            monitor.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::persist::save_json;
    use anyhow::Result;

    fn base() -> MonitorConfig {
        MonitorConfig {
            nodes: vec![MonitoredNode {
                name: "pve1".to_string(),
                url: "https://pve1:8006".to_string(),
                kind: "pve".to_string(),
            }],
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn org_dirs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persistence = MultiTenantPersistence::new(dir.path(), base());
        assert_eq!(persistence.org_dir("default")?, dir.path());
        assert_eq!(persistence.org_dir("acme")?, dir.path().join("orgs").join("acme"));
        assert!(matches!(
            persistence.org_dir(".."),
            Err(TenantError::InvalidOrgId(_))
        ));
        assert!(!persistence.org_exists("acme"));
        persistence.create_org_dir("acme")?;
        assert!(persistence.org_exists("acme"));
        Ok(())
    }

    #[test]
    fn tenant_config_is_an_independent_copy() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persistence = MultiTenantPersistence::new(dir.path(), base());
        persistence.create_org_dir("acme")?;
        let mut acme = persistence.load_config("acme")?;
        acme.nodes.clear();
        assert_eq!(persistence.load_config("default")?.nodes.len(), 1);

        let beta_dir = persistence.create_org_dir("beta")?;
        save_json(
            &beta_dir.join(MONITOR_CONFIG_FILE),
            &MonitorConfig {
                poll_interval_seconds: 30,
                ..MonitorConfig::default()
            },
        )?;
        let beta = persistence.load_config("beta")?;
        assert_eq!(beta.poll_interval_seconds, 30);
        assert!(beta.nodes.is_empty());
        Ok(())
    }

    #[test]
    fn monitors_are_cached_and_closed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persistence = Arc::new(MultiTenantPersistence::new(dir.path(), base()));
        persistence.create_org_dir("acme")?;
        let monitors = TenantMonitors::new(persistence);
        let first = monitors.get("acme")?;
        let second = monitors.get("acme")?;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(matches!(monitors.get("ghost"), Err(TenantError::UnknownOrg(_))));
        monitors.get("default")?;
        assert_eq!(monitors.len(), 2);
        monitors.remove("acme");
        assert_eq!(monitors.len(), 1);
        monitors.close();
        assert!(monitors.is_empty());
        Ok(())
    }
}
