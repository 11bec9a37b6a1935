//! Permission mutation service.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use crate::error::{CredError, Result};
use crate::identity::UserContext;
use crate::permission::{AccessControlEntry, PermissionChecker, PermissionOperation};
use crate::secret::SecretPath;
use crate::store::PermissionStore;

#[derive(Clone)]
pub struct AclService {
    checker: PermissionChecker,
    store: Arc<dyn PermissionStore>,
}

impl AclService {
    pub fn new(checker: PermissionChecker, store: Arc<dyn PermissionStore>) -> Self {
        Self { checker, store }
    }

    pub fn allowed_operations(
        &self,
        path: &SecretPath,
        actor: &str,
    ) -> Result<BTreeSet<PermissionOperation>> {
        self.store.allowed_operations(path, actor)
    }

    pub fn access_control_list(&self, path: &SecretPath) -> Result<Vec<AccessControlEntry>> {
        self.store.access_control_list(path)
    }

    pub fn save_access_control_entries(
        &self,
        path: &SecretPath,
        entries: &[AccessControlEntry],
    ) -> Result<()> {
        self.store.save_access_control_entries(path, entries)
    }

    /// Checks that `context` may remove `target`'s entry on `path`.
    ///
    /// Without WRITE_ACL the answer is `EntryNotFound`, exactly as if the
    /// entry did not exist. Only then is self-revocation rejected, so a
    /// caller without rights learns nothing about its own entries.
    pub fn authorize_delete(
        &self,
        context: &UserContext,
        path: &SecretPath,
        target: &str,
    ) -> Result<()> {
        let actor = context.actor().unwrap_or_default();
        if !self
            .checker
            .has_permission(&actor, path, PermissionOperation::WriteAcl)
        {
            return Err(CredError::EntryNotFound);
        }
        if !self
            .checker
            .user_allowed_to_operate_on_actor(context, Some(target))
        {
            info!(actor = %actor, path = %path, "rejected self-revocation");
            return Err(CredError::InvalidAclOperation);
        }
        Ok(())
    }

    /// Remove `target`'s entry on `path`, returning whether the store held one.
    pub fn delete_access_control_entry(
        &self,
        context: &UserContext,
        path: &SecretPath,
        target: &str,
    ) -> Result<bool> {
        self.authorize_delete(context, path, target)?;
        self.store.delete_access_control_entry(path, target)
    }
}
