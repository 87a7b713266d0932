//! Role-based access control, one manager per org.
//!
//! Built-in roles are immutable and never written to disk. Custom roles,
//! user assignments and the change log live in `<orgDir>/rbac/rbac.json`,
//! replaced atomically on every mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, info};
use ulid::Ulid;

use super::{
    DEFAULT_ORG_ID, MultiTenantPersistence, TenantError,
    orgs::{can_access_org, load_org},
};
use crate::api::handlers::{
    auth::AuthContext,
    persist::{StoreError, load_json, save_json},
};

pub const RBAC_DIR: &str = "rbac";
pub const RBAC_FILE: &str = "rbac.json";
pub const MAX_INHERITANCE_DEPTH: usize = 10;
const MAX_CHANGELOG: usize = 1000;

pub const ACTION_READ: &str = "read";
pub const ACTION_WRITE: &str = "write";
pub const ACTION_ADMIN: &str = "admin";
pub const RESOURCE_ALL: &str = "*";
pub const RESOURCE_AUDIT_LOGS: &str = "audit_logs";
pub const RESOURCE_USERS: &str = "users";
pub const RESOURCE_NODES: &str = "nodes";
pub const RESOURCE_VMS: &str = "vms";
pub const RESOURCE_CONTAINERS: &str = "containers";
pub const RESOURCE_ALERTS: &str = "alerts";
pub const RESOURCE_COMPLIANCE: &str = "compliance";
pub const RESOURCE_SETTINGS: &str = "settings";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub effect: Effect,
}

impl Permission {
    #[must_use]
    pub fn allow(action: &str, resource: &str) -> Self {
        Self {
            action: action.to_string(),
            resource: resource.to_string(),
            effect: Effect::Allow,
        }
    }

    #[must_use]
    pub fn deny(action: &str, resource: &str) -> Self {
        Self {
            effect: Effect::Deny,
            ..Self::allow(action, resource)
        }
    }

    /// `admin` matches every action and `*` every resource.
    #[must_use]
    pub fn matches(&self, action: &str, resource: &str) -> bool {
        (self.action == action || self.action == ACTION_ADMIN)
            && (self.resource == resource || self.resource == RESOURCE_ALL)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub is_builtin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn builtin(id: &str, name: &str, description: &str, permissions: Vec<Permission>) -> Role {
    Role {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        parent_id: None,
        permissions,
        is_builtin: true,
        created_at: DateTime::<Utc>::default(),
        updated_at: DateTime::<Utc>::default(),
    }
}

/// `admin`, `operator`, `viewer` and `auditor`.
#[must_use]
pub fn builtin_roles() -> Vec<Role> {
    vec![
        builtin(
            "admin",
            "Administrator",
            "Full access to every resource",
            vec![Permission::allow(ACTION_ADMIN, RESOURCE_ALL)],
        ),
        builtin(
            "operator",
            "Operator",
            "Read everything and manage infrastructure",
            vec![
                Permission::allow(ACTION_READ, RESOURCE_ALL),
                Permission::allow(ACTION_WRITE, RESOURCE_NODES),
                Permission::allow(ACTION_WRITE, RESOURCE_VMS),
                Permission::allow(ACTION_WRITE, RESOURCE_CONTAINERS),
                Permission::allow(ACTION_WRITE, RESOURCE_ALERTS),
            ],
        ),
        builtin(
            "viewer",
            "Viewer",
            "Read-only access",
            vec![Permission::allow(ACTION_READ, RESOURCE_ALL)],
        ),
        builtin(
            "auditor",
            "Auditor",
            "Read audit logs and compliance data",
            vec![
                Permission::allow(ACTION_READ, RESOURCE_AUDIT_LOGS),
                Permission::allow(ACTION_READ, RESOURCE_NODES),
                Permission::allow(ACTION_READ, RESOURCE_ALERTS),
                Permission::allow(ACTION_READ, RESOURCE_COMPLIANCE),
            ],
        ),
    ]
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub details: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RbacData {
    #[serde(default)]
    roles: Vec<Role>,
    #[serde(default)]
    assignments: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    changelog: Vec<ChangeLogEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum RbacError {
    #[error("built-in role {0} cannot be modified")]
    BuiltinImmutable(String),
    #[error("role not found: {0}")]
    NotFound(String),
    #[error("role inheritance cycle through {0}")]
    Cycle(String),
    #[error("role inheritance deeper than {MAX_INHERITANCE_DEPTH} levels")]
    TooDeep,
    #[error("invalid role: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tenant(#[from] TenantError),
}

/// Fields a caller may set on a custom role.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleInput {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

#[derive(Debug)]
pub struct RbacManager {
    path: Option<PathBuf>,
    builtins: HashMap<String, Role>,
    data: RwLock<RbacData>,
}

fn valid_role_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl RbacManager {
    /// Load `<dir>/rbac/rbac.json`, starting empty when it does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(org_dir: &Path) -> Result<Self, RbacError> {
        let path = org_dir.join(RBAC_DIR).join(RBAC_FILE);
        let data = load_json::<RbacData>(&path)?.unwrap_or_default();
        debug!(
            path = %path.display(),
            roles = data.roles.len(),
            users = data.assignments.len(),
            "Loaded RBAC state"
        );
        Ok(Self {
            path: Some(path),
            ..Self::in_memory()
        }
        .with_data(data))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            builtins: builtin_roles()
                .into_iter()
                .map(|role| (role.id.clone(), role))
                .collect(),
            data: RwLock::new(RbacData::default()),
        }
    }

    fn with_data(self, data: RbacData) -> Self {
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = data;
        self
    }

    fn persist(&self, data: &RbacData) -> Result<(), RbacError> {
        if let Some(path) = &self.path {
            save_json(path, data)?;
        }
        Ok(())
    }

    /// Apply `mutate` to a copy, persist it, then publish it.
    fn mutate<T>(
        &self,
        mutate: impl FnOnce(&mut RbacData) -> Result<T, RbacError>,
    ) -> Result<T, RbacError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = data.clone();
        let result = mutate(&mut next)?;
        if next.changelog.len() > MAX_CHANGELOG {
            let excess = next.changelog.len() - MAX_CHANGELOG;
            next.changelog.drain(..excess);
        }
        self.persist(&next)?;
        *data = next;
        Ok(result)
    }

    /// Built-in roles followed by custom roles, sorted by ID.
    #[must_use]
    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.builtins.values().cloned().collect();
        roles.sort_by(|a, b| a.id.cmp(&b.id));
        let mut custom = self
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .roles
            .clone();
        custom.sort_by(|a, b| a.id.cmp(&b.id));
        roles.extend(custom);
        roles
    }

    #[must_use]
    pub fn role(&self, id: &str) -> Option<Role> {
        if let Some(role) = self.builtins.get(id) {
            return Some(role.clone());
        }
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .roles
            .iter()
            .find(|role| role.id == id)
            .cloned()
    }

    fn lookup<'a>(&'a self, data: &'a RbacData, id: &str) -> Option<&'a Role> {
        self.builtins
            .get(id)
            .or_else(|| data.roles.iter().find(|role| role.id == id))
    }

    /// Walk the parent chain of `start`, rejecting cycles and deep chains.
    fn chain<'a>(&'a self, data: &'a RbacData, start: &'a Role) -> Result<Vec<&'a Role>, RbacError> {
        let mut chain = vec![start];
        let mut seen = HashSet::from([start.id.as_str()]);
        let mut current = start;
        while let Some(parent_id) = current.parent_id.as_deref() {
            if !seen.insert(parent_id) {
                return Err(RbacError::Cycle(parent_id.to_string()));
            }
            if chain.len() > MAX_INHERITANCE_DEPTH {
                return Err(RbacError::TooDeep);
            }
            let parent = self
                .lookup(data, parent_id)
                .ok_or_else(|| RbacError::NotFound(parent_id.to_string()))?;
            chain.push(parent);
            current = parent;
        }
        Ok(chain)
    }

    /// Create or replace a custom role.
    ///
    /// # Errors
    /// Rejects built-in IDs, invalid IDs or names, unknown parents, cycles,
    /// deep chains and persistence failures.
    pub fn save_role(&self, input: RoleInput) -> Result<Role, RbacError> {
        let id = input.id.trim().to_string();
        if !valid_role_id(&id) {
            return Err(RbacError::Invalid(format!("invalid role ID {id:?}")));
        }
        if self.builtins.contains_key(&id) {
            return Err(RbacError::BuiltinImmutable(id));
        }
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(RbacError::Invalid("role name is required".to_string()));
        }
        if let Some(permission) = input
            .permissions
            .iter()
            .find(|p| p.action.trim().is_empty() || p.resource.trim().is_empty())
        {
            return Err(RbacError::Invalid(format!(
                "permission needs an action and a resource: {permission:?}"
            )));
        }
        let parent_id = input
            .parent_id
            .map(|parent| parent.trim().to_string())
            .filter(|parent| !parent.is_empty());

        self.mutate(|data| {
            let now = Utc::now();
            let existing = data.roles.iter().position(|role| role.id == id);
            let role = Role {
                id: id.clone(),
                name,
                description: input.description,
                parent_id,
                permissions: input.permissions,
                is_builtin: false,
                created_at: existing.map_or(now, |index| data.roles[index].created_at),
                updated_at: now,
            };
            match existing {
                Some(index) => data.roles[index] = role.clone(),
                None => data.roles.push(role.clone()),
            }
            if let Some(stored) = data.roles.iter().find(|r| r.id == id) {
                self.chain(data, stored)?;
            }
            data.changelog.push(ChangeLogEntry {
                id: Ulid::new().to_string(),
                timestamp: now,
                action: if existing.is_some() { "role_updated" } else { "role_created" }.to_string(),
                role_id: Some(id.clone()),
                username: None,
                details: format!("{} permissions", role.permissions.len()),
            });
            Ok(role)
        })
    }

    /// Delete a custom role, its assignments and its children's parent link.
    ///
    /// # Errors
    /// Rejects built-in or unknown roles and persistence failures.
    pub fn delete_role(&self, id: &str) -> Result<(), RbacError> {
        if self.builtins.contains_key(id) {
            return Err(RbacError::BuiltinImmutable(id.to_string()));
        }
        self.mutate(|data| {
            let before = data.roles.len();
            data.roles.retain(|role| role.id != id);
            if data.roles.len() == before {
                return Err(RbacError::NotFound(id.to_string()));
            }
            for role in &mut data.roles {
                if role.parent_id.as_deref() == Some(id) {
                    role.parent_id = None;
                }
            }
            for roles in data.assignments.values_mut() {
                roles.retain(|role| role != id);
            }
            data.assignments.retain(|_, roles| !roles.is_empty());
            data.changelog.push(ChangeLogEntry {
                id: Ulid::new().to_string(),
                timestamp: Utc::now(),
                action: "role_deleted".to_string(),
                role_id: Some(id.to_string()),
                username: None,
                details: String::new(),
            });
            Ok(())
        })
    }

    /// Replace the roles assigned to `username`. An empty list removes them.
    ///
    /// # Errors
    /// Rejects unknown roles and persistence failures.
    pub fn assign_roles(&self, username: &str, role_ids: &[String]) -> Result<Vec<String>, RbacError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(RbacError::Invalid("username is required".to_string()));
        }
        let mut roles: Vec<String> = Vec::new();
        for id in role_ids.iter().map(|id| id.trim()) {
            if !roles.iter().any(|r| r == id) {
                roles.push(id.to_string());
            }
        }
        self.mutate(|data| {
            if let Some(unknown) = roles.iter().find(|id| self.lookup(data, id).is_none()) {
                return Err(RbacError::NotFound(unknown.clone()));
            }
            if roles.is_empty() {
                data.assignments.remove(username);
            } else {
                data.assignments.insert(username.to_string(), roles.clone());
            }
            data.changelog.push(ChangeLogEntry {
                id: Ulid::new().to_string(),
                timestamp: Utc::now(),
                action: "roles_assigned".to_string(),
                role_id: None,
                username: Some(username.to_string()),
                details: roles.join(","),
            });
            Ok(roles.clone())
        })
    }

    #[must_use]
    pub fn user_roles(&self, username: &str) -> Vec<String> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .assignments
            .get(username)
            .cloned()
            .unwrap_or_default()
    }

    /// Permissions of every assigned role and its ancestors.
    ///
    /// # Errors
    /// Returns an error when an inheritance chain is broken.
    pub fn effective_permissions(&self, username: &str) -> Result<Vec<Permission>, RbacError> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let mut permissions = Vec::new();
        for id in data.assignments.get(username).into_iter().flatten() {
            let Some(role) = self.lookup(&data, id) else {
                continue;
            };
            for role in self.chain(&data, role)? {
                permissions.extend(role.permissions.iter().cloned());
            }
        }
        Ok(permissions)
    }

    /// Deny overrides allow.
    ///
    /// # Errors
    /// Returns an error when an inheritance chain is broken.
    pub fn is_allowed(&self, username: &str, action: &str, resource: &str) -> Result<bool, RbacError> {
        let permissions = self.effective_permissions(username)?;
        let matching = permissions.iter().filter(|p| p.matches(action, resource));
        let mut allowed = false;
        for permission in matching {
            match permission.effect {
                Effect::Deny => return Ok(false),
                Effect::Allow => allowed = true,
            }
        }
        Ok(allowed)
    }

    /// Newest entries last, at most `limit`.
    #[must_use]
    pub fn changelog(&self, limit: usize) -> Vec<ChangeLogEntry> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let skip = data.changelog.len().saturating_sub(limit);
        data.changelog[skip..].to_vec()
    }
}

/// Decides whether a principal may perform `action` on `resource` in an org.
pub trait Authorizer: Send + Sync {
    /// # Errors
    /// Returns an error when the decision cannot be made.
    fn authorize(
        &self,
        ctx: &AuthContext,
        org_id: &str,
        action: &str,
        resource: &str,
    ) -> Result<bool, RbacError>;
}

/// Lazily opened, cached RBAC managers per org.
#[derive(Debug)]
pub struct TenantRbacProvider {
    persistence: Arc<MultiTenantPersistence>,
    managers: RwLock<HashMap<String, Arc<RbacManager>>>,
}

impl TenantRbacProvider {
    #[must_use]
    pub fn new(persistence: Arc<MultiTenantPersistence>) -> Self {
        Self {
            persistence,
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Create-or-return the manager for `org_id`.
    ///
    /// # Errors
    /// Returns an error for unknown orgs or an unreadable RBAC file.
    pub fn get_manager(&self, org_id: &str) -> Result<Arc<RbacManager>, RbacError> {
        if let Some(manager) = self
            .managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(org_id)
        {
            return Ok(Arc::clone(manager));
        }
        let mut managers = self.managers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(manager) = managers.get(org_id) {
            return Ok(Arc::clone(manager));
        }
        if !self.persistence.org_exists(org_id) {
            return Err(TenantError::UnknownOrg(org_id.to_string()).into());
        }
        let manager = Arc::new(RbacManager::open(&self.persistence.org_dir(org_id)?)?);
        managers.insert(org_id.to_string(), Arc::clone(&manager));
        Ok(manager)
    }

    #[must_use]
    pub fn persistence(&self) -> &Arc<MultiTenantPersistence> {
        &self.persistence
    }

    pub fn remove_tenant(&self, org_id: &str) {
        if self
            .managers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(org_id)
            .is_some()
        {
            debug!(org_id, "Evicted tenant RBAC manager");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        let mut managers = self.managers.write().unwrap_or_else(PoisonError::into_inner);
        info!(tenants = managers.len(), "Closing tenant RBAC managers");
        managers.clear();
    }
}

/// Authorizer backed by the org's RBAC manager.
///
/// Users are denied in orgs they do not belong to. Members without role
/// assignments keep their admin capability; token principals are limited by
/// scopes instead.
#[derive(Clone, Debug)]
pub struct RbacAuthorizer {
    provider: Arc<TenantRbacProvider>,
}

impl RbacAuthorizer {
    #[must_use]
    pub fn new(provider: Arc<TenantRbacProvider>) -> Self {
        Self { provider }
    }
}

impl Authorizer for RbacAuthorizer {
    fn authorize(
        &self,
        ctx: &AuthContext,
        org_id: &str,
        action: &str,
        resource: &str,
    ) -> Result<bool, RbacError> {
        let Some(username) = ctx.principal.username() else {
            return Ok(ctx.principal.is_admin_capable());
        };
        if org_id != DEFAULT_ORG_ID {
            let org = load_org(self.provider.persistence(), org_id)?;
            if !can_access_org(ctx, org_id, org.as_ref()) {
                debug!(user = username, org_id, "User is not a member of the organization");
                return Ok(false);
            }
        }
        let manager = self.provider.get_manager(org_id)?;
        if manager.user_roles(username).is_empty() {
            return Ok(ctx.principal.is_admin_capable());
        }
        manager.is_allowed(username, action, resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::{
        auth::{AuthMethod, Principal},
        tenant::{
            MonitorConfig,
            orgs::{Organization, save_org},
        },
    };
    use anyhow::Result;

    fn input(id: &str, parent: Option<&str>, permissions: Vec<Permission>) -> RoleInput {
        RoleInput {
            id: id.to_string(),
            name: id.to_uppercase(),
            description: String::new(),
            parent_id: parent.map(ToString::to_string),
            permissions,
        }
    }

    #[test]
    fn builtin_roles_are_immutable() {
        let manager = RbacManager::in_memory();
        assert_eq!(manager.roles().len(), 4);
        assert!(matches!(
            manager.save_role(input("admin", None, vec![])),
            Err(RbacError::BuiltinImmutable(_))
        ));
        assert!(matches!(
            manager.delete_role("viewer"),
            Err(RbacError::BuiltinImmutable(_))
        ));
    }

    #[test]
    fn wildcards_and_deny_override() -> Result<()> {
        let manager = RbacManager::in_memory();
        manager.save_role(input(
            "limited",
            Some("operator"),
            vec![Permission::deny(ACTION_WRITE, RESOURCE_VMS)],
        ))?;
        manager.assign_roles("alice", &["limited".to_string()])?;
        assert!(manager.is_allowed("alice", ACTION_READ, RESOURCE_SETTINGS)?);
        assert!(manager.is_allowed("alice", ACTION_WRITE, RESOURCE_NODES)?);
        assert!(!manager.is_allowed("alice", ACTION_WRITE, RESOURCE_VMS)?);
        assert!(!manager.is_allowed("alice", ACTION_ADMIN, RESOURCE_USERS)?);

        manager.assign_roles("root", &["admin".to_string()])?;
        assert!(manager.is_allowed("root", ACTION_WRITE, RESOURCE_SETTINGS)?);
        assert!(manager.is_allowed("root", ACTION_ADMIN, RESOURCE_USERS)?);
        Ok(())
    }

    #[test]
    fn cycles_and_unknown_parents_are_rejected() -> Result<()> {
        let manager = RbacManager::in_memory();
        manager.save_role(input("a", None, vec![]))?;
        manager.save_role(input("b", Some("a"), vec![]))?;
        assert!(matches!(
            manager.save_role(input("a", Some("b"), vec![])),
            Err(RbacError::Cycle(_))
        ));
        assert_eq!(manager.role("a").and_then(|r| r.parent_id), None);
        assert!(matches!(
            manager.save_role(input("c", Some("missing"), vec![])),
            Err(RbacError::NotFound(_))
        ));
        assert!(manager.role("c").is_none());
        Ok(())
    }

    #[test]
    fn inheritance_depth_is_bounded() -> Result<()> {
        let manager = RbacManager::in_memory();
        manager.save_role(input("r0", None, vec![]))?;
        for i in 1..=MAX_INHERITANCE_DEPTH {
            manager.save_role(input(&format!("r{i}"), Some(&format!("r{}", i - 1)), vec![]))?;
        }
        let next = MAX_INHERITANCE_DEPTH + 1;
        assert!(matches!(
            manager.save_role(input(
                &format!("r{next}"),
                Some(&format!("r{MAX_INHERITANCE_DEPTH}")),
                vec![]
            )),
            Err(RbacError::TooDeep)
        ));
        Ok(())
    }

    #[test]
    fn deleting_a_role_cleans_up() -> Result<()> {
        let manager = RbacManager::in_memory();
        manager.save_role(input("parent", None, vec![]))?;
        manager.save_role(input("child", Some("parent"), vec![]))?;
        manager.assign_roles("bob", &["parent".to_string()])?;
        manager.delete_role("parent")?;
        assert!(manager.user_roles("bob").is_empty());
        assert_eq!(manager.role("child").and_then(|r| r.parent_id), None);
        assert!(matches!(
            manager.delete_role("parent"),
            Err(RbacError::NotFound(_))
        ));
        let actions: Vec<String> = manager.changelog(10).into_iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            ["role_created", "role_created", "roles_assigned", "role_deleted"]
        );
        Ok(())
    }

    #[test]
    fn state_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let manager = RbacManager::open(dir.path())?;
            manager.save_role(input("ops", None, vec![Permission::allow("write", "nodes")]))?;
            manager.assign_roles("carol", &["ops".to_string()])?;
        }
        let reopened = RbacManager::open(dir.path())?;
        assert_eq!(reopened.user_roles("carol"), vec!["ops".to_string()]);
        assert!(reopened.is_allowed("carol", "write", "nodes")?);
        assert!(dir.path().join(RBAC_DIR).join(RBAC_FILE).is_file());
        Ok(())
    }

    #[test]
    fn authorizer_falls_back_to_admin_capability() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persistence = Arc::new(MultiTenantPersistence::new(
            dir.path(),
            MonitorConfig::default(),
        ));
        let provider = Arc::new(TenantRbacProvider::new(persistence));
        let authorizer = RbacAuthorizer::new(Arc::clone(&provider));

        let ctx = |principal| AuthContext {
            principal,
            method: Some(AuthMethod::Proxy),
            ..AuthContext::unauthenticated(None, None)
        };
        let admin = ctx(Principal::ProxyUser {
            name: "alice".to_string(),
            admin: true,
        });
        let plain = ctx(Principal::ProxyUser {
            name: "bob".to_string(),
            admin: false,
        });
        assert!(authorizer.authorize(&admin, "default", ACTION_ADMIN, RESOURCE_USERS)?);
        assert!(!authorizer.authorize(&plain, "default", ACTION_ADMIN, RESOURCE_USERS)?);

        provider
            .get_manager("default")?
            .assign_roles("alice", &["viewer".to_string()])?;
        assert!(!authorizer.authorize(&admin, "default", ACTION_ADMIN, RESOURCE_USERS)?);
        assert!(authorizer.authorize(&admin, "default", ACTION_READ, RESOURCE_AUDIT_LOGS)?);

        assert!(!authorizer.authorize(&admin, "ghost", ACTION_READ, RESOURCE_NODES)?);
        assert_eq!(provider.len(), 1);
        provider.remove_tenant("default");
        assert!(provider.is_empty());
        Ok(())
    }

    #[test]
    fn authorizer_denies_non_members() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persistence = Arc::new(MultiTenantPersistence::new(
            dir.path(),
            MonitorConfig::default(),
        ));
        save_org(&persistence, &Organization::new("acme", "Acme", "alice"))?;
        save_org(&persistence, &Organization::new("beta", "Beta", "bob"))?;
        let provider = Arc::new(TenantRbacProvider::new(Arc::clone(&persistence)));
        let authorizer = RbacAuthorizer::new(Arc::clone(&provider));

        let alice = AuthContext {
            principal: Principal::LocalUser { name: "alice".to_string() },
            method: Some(AuthMethod::Session),
            ..AuthContext::unauthenticated(None, None)
        };
        assert!(authorizer.authorize(&alice, "acme", ACTION_ADMIN, RESOURCE_USERS)?);
        assert!(!authorizer.authorize(&alice, "beta", ACTION_ADMIN, RESOURCE_USERS)?);
        assert!(!authorizer.authorize(&alice, "beta", ACTION_READ, RESOURCE_AUDIT_LOGS)?);
        assert!(authorizer.authorize(&alice, DEFAULT_ORG_ID, ACTION_READ, RESOURCE_AUDIT_LOGS)?);

        provider
            .get_manager("acme")?
            .assign_roles("alice", &["viewer".to_string()])?;
        assert!(!authorizer.authorize(&alice, "acme", ACTION_ADMIN, RESOURCE_USERS)?);
        Ok(())
    }
}
