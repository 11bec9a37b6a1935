//! Permission model and the permission checking service.
//!
//! Enforcement is a construction-time switch. With enforcement off every
//! check passes; that path is kept apart from the enforced one and never
//! consults the store.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::identity::UserContext;
use crate::secret::SecretPath;
use crate::store::PermissionStore;

/// An operation a permission entry can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOperation {
    Read,
    Write,
    Delete,
    ReadAcl,
    WriteAcl,
}

impl PermissionOperation {
    pub const ALL: [Self; 5] = [
        Self::Read,
        Self::Write,
        Self::Delete,
        Self::ReadAcl,
        Self::WriteAcl,
    ];
}

impl fmt::Display for PermissionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::ReadAcl => "read_acl",
            Self::WriteAcl => "write_acl",
        };
        f.write_str(tag)
    }
}

/// What a caller asks for: operations for one actor on the request's path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlEntry {
    pub actor: String,
    pub operations: BTreeSet<PermissionOperation>,
}

impl AccessControlEntry {
    pub fn new(
        actor: impl Into<String>,
        operations: impl IntoIterator<Item = PermissionOperation>,
    ) -> Self {
        Self {
            actor: actor.into(),
            operations: operations.into_iter().collect(),
        }
    }
}

/// A stored permission entry.
///
/// `path` is either a secret path or a pattern ending in `*` that covers
/// every path starting with the part before the star.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub uuid: Uuid,
    pub path: String,
    pub actor: String,
    pub operations: BTreeSet<PermissionOperation>,
}

impl PermissionEntry {
    pub fn new(
        path: impl Into<String>,
        actor: impl Into<String>,
        operations: impl IntoIterator<Item = PermissionOperation>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            path: path.into(),
            actor: actor.into(),
            operations: operations.into_iter().collect(),
        }
    }

    /// Whether this entry governs `path`.
    pub fn covers(&self, path: &str) -> bool {
        path_matches(&self.path, path)
    }
}

/// Case-insensitive match of a stored path or `prefix*` pattern.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path
            .get(..prefix.len())
            .map_or(false, |head| head.eq_ignore_ascii_case(prefix)),
        None => pattern.eq_ignore_ascii_case(path),
    }
}

/// What a permission check is about.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    Path(&'a SecretPath),
    /// A stored permission entry, looked up by id.
    Id(Uuid),
}

impl<'a> From<&'a SecretPath> for Resource<'a> {
    fn from(path: &'a SecretPath) -> Self {
        Self::Path(path)
    }
}

impl From<Uuid> for Resource<'_> {
    fn from(id: Uuid) -> Self {
        Self::Id(id)
    }
}

/// Stateless authorization predicate over (actor, resource, operation).
#[derive(Clone)]
pub struct PermissionChecker {
    enforce: bool,
    store: Arc<dyn PermissionStore>,
}

impl PermissionChecker {
    pub fn new(enforce: bool, store: Arc<dyn PermissionStore>) -> Self {
        Self { enforce, store }
    }

    pub fn is_enforced(&self) -> bool {
        self.enforce
    }

    pub fn has_permission<'a>(
        &self,
        actor: &str,
        resource: impl Into<Resource<'a>>,
        operation: PermissionOperation,
    ) -> bool {
        let resource = resource.into();
        if !self.enforce {
            trace!(actor, %operation, "permission enforcement disabled, allowing");
            return true;
        }
        self.check_enforced(actor, resource, operation)
    }

    /// True iff every operation passes; stops at the first that does not.
    pub fn has_permissions(
        &self,
        actor: &str,
        path: &SecretPath,
        operations: &[PermissionOperation],
    ) -> bool {
        operations
            .iter()
            .all(|operation| self.has_permission(actor, path, *operation))
    }

    /// Whether the caller may act on `target`'s permissions. A caller may
    /// never be the target of its own actor-scoped operation.
    pub fn user_allowed_to_operate_on_actor(
        &self,
        context: &UserContext,
        target: Option<&str>,
    ) -> bool {
        if !self.enforce {
            return true;
        }
        match (context.actor(), target) {
            (Some(own), Some(target)) => own != target,
            _ => false,
        }
    }

    /// As `user_allowed_to_operate_on_actor`, with the target read from a
    /// stored permission entry. A missing entry is a denial.
    pub fn user_allowed_to_operate_on_entry(&self, context: &UserContext, id: Uuid) -> bool {
        if !self.enforce {
            return true;
        }
        match self.store.permission(id) {
            Ok(Some(entry)) => self.user_allowed_to_operate_on_actor(context, Some(&entry.actor)),
            Ok(None) => false,
            Err(err) => {
                warn!(%id, error = %err, "permission lookup failed, denying");
                false
            }
        }
    }

    fn check_enforced(
        &self,
        actor: &str,
        resource: Resource<'_>,
        operation: PermissionOperation,
    ) -> bool {
        let path = match resource {
            Resource::Path(path) => path.clone(),
            Resource::Id(id) => match self.store.permission(id) {
                Ok(Some(entry)) => match SecretPath::parse(&entry.path) {
                    Ok(path) => path,
                    Err(_) => {
                        debug!(%id, path = %entry.path, "entry path is a pattern, denying id lookup");
                        return false;
                    }
                },
                Ok(None) => {
                    debug!(%id, actor, %operation, "no permission entry for id, denying");
                    return false;
                }
                Err(err) => {
                    warn!(%id, error = %err, "permission lookup failed, denying");
                    return false;
                }
            },
        };

        match self.store.has_permission(actor, &path, operation) {
            Ok(true) => true,
            Ok(false) => {
                debug!(actor, path = %path, %operation, "permission denied");
                false
            }
            Err(err) => {
                warn!(actor, path = %path, %operation, error = %err, "permission lookup failed, denying");
                false
            }
        }
    }
}
