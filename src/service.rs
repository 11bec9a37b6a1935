//! Guarded secret operations.
//!
//! Every operation follows the same pipeline:
//!
//! 1. validate the request,
//! 2. check permissions, where a denial ends the request as `EntryNotFound`,
//! 3. perform side effects through the encryptor into a [`UnitOfWork`],
//! 4. commit side effects and audit records together.
//!
//! A failure at any step commits the audit records alone, stamped with the
//! failure's status. Nothing is written before the permission check passes.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::acl::AclService;
use crate::audit::{build_auth_failure_audit, AuditOperation, AuditRecord, AuditTrail};
use crate::config::CoreConfig;
use crate::encryptor::Encryptor;
use crate::error::{CredError, Result};
use crate::identity::{RequestDescriptor, TokenClaims, UserContext};
use crate::permission::{AccessControlEntry, PermissionChecker, PermissionOperation};
use crate::registry::KeyProviderRegistry;
use crate::secret::{CredentialType, SecretPath, SecretVersion};
use crate::store::{Committer, MemoryStore, PermissionStore, SecretVersionStore, UnitOfWork};

const STATUS_OK: u16 = 200;
const STATUS_NO_CONTENT: u16 = 204;

/// A decrypted version as handed back to a caller.
#[derive(Clone)]
pub struct RevealedSecret {
    pub uuid: Uuid,
    pub name: SecretPath,
    pub credential_type: CredentialType,
    pub created_at: DateTime<Utc>,
    pub value: Option<Zeroizing<Vec<u8>>>,
}

impl fmt::Debug for RevealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevealedSecret")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("credential_type", &self.credential_type)
            .field("created_at", &self.created_at)
            .field("value", &self.value.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// The persistence collaborators of a [`SecretService`].
#[derive(Clone)]
pub struct Stores {
    pub permissions: Arc<dyn PermissionStore>,
    pub versions: Arc<dyn SecretVersionStore>,
    pub committer: Arc<dyn Committer>,
}

impl Stores {
    /// All three roles played by one in-memory store.
    pub fn memory(store: &Arc<MemoryStore>) -> Self {
        Self {
            permissions: store.clone(),
            versions: store.clone(),
            committer: store.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SecretService {
    checker: PermissionChecker,
    acl: AclService,
    encryptor: Encryptor,
    versions: Arc<dyn SecretVersionStore>,
    committer: Arc<dyn Committer>,
}

impl SecretService {
    pub fn new(config: &CoreConfig, registry: Arc<KeyProviderRegistry>, stores: Stores) -> Self {
        let checker = PermissionChecker::new(config.enforce_permissions, stores.permissions.clone());
        Self {
            acl: AclService::new(checker.clone(), stores.permissions),
            checker,
            encryptor: Encryptor::new(registry),
            versions: stores.versions,
            committer: stores.committer,
        }
    }

    pub fn checker(&self) -> &PermissionChecker {
        &self.checker
    }

    pub fn acl(&self) -> &AclService {
        &self.acl
    }

    pub fn encryptor(&self) -> &Encryptor {
        &self.encryptor
    }

    /// Versions of `name`: only the latest when `current`, otherwise all of
    /// them newest first.
    pub fn get_by_name(
        &self,
        context: &UserContext,
        request: &RequestDescriptor,
        name: &str,
        current: bool,
    ) -> Result<Vec<RevealedSecret>> {
        self.guarded(context, request, STATUS_OK, |trail, _work| {
            let path = SecretPath::parse(name)?;
            trail.event(AuditOperation::CredentialAccess, path.as_str());
            self.require(context, &path, PermissionOperation::Read)?;

            let versions: Vec<SecretVersion> = if current {
                self.versions.find_latest(&path)?.into_iter().collect()
            } else {
                self.versions.find_all(&path)?
            };
            if versions.is_empty() {
                return Err(CredError::EntryNotFound);
            }
            versions.iter().map(|v| self.reveal(v)).collect()
        })
    }

    pub fn get_by_id(
        &self,
        context: &UserContext,
        request: &RequestDescriptor,
        id: Uuid,
    ) -> Result<RevealedSecret> {
        self.guarded(context, request, STATUS_OK, |trail, _work| {
            let version = self
                .versions
                .find_by_id(id)?
                .ok_or(CredError::EntryNotFound)?;
            trail.event(AuditOperation::CredentialAccess, version.name().as_str());
            self.require(context, version.name(), PermissionOperation::Read)?;
            self.reveal(&version)
        })
    }

    /// Names at or below `prefix` the caller may read.
    pub fn find_by_path(
        &self,
        context: &UserContext,
        request: &RequestDescriptor,
        prefix: &str,
    ) -> Result<Vec<SecretPath>> {
        self.guarded(context, request, STATUS_OK, |trail, _work| {
            let prefix = if prefix.starts_with('/') {
                prefix.to_string()
            } else {
                format!("/{prefix}")
            };
            trail.event(AuditOperation::CredentialFind, &prefix);
            let actor = context.actor().unwrap_or_default();
            let names = self.versions.find_names(&prefix)?;
            Ok(names
                .into_iter()
                .filter(|name| {
                    self.checker
                        .has_permission(&actor, name, PermissionOperation::Read)
                })
                .collect())
        })
    }

    /// Write a new version of `name`.
    ///
    /// Creating a secret needs WRITE on its path before the secret exists.
    /// The creator is granted every operation in the same unit of work,
    /// ahead of the version itself.
    pub fn set(
        &self,
        context: &UserContext,
        request: &RequestDescriptor,
        name: &str,
        credential_type: CredentialType,
        value: &[u8],
    ) -> Result<SecretVersion> {
        self.guarded(context, request, STATUS_OK, |trail, work| {
            let path = SecretPath::parse(name)?;
            trail.event(AuditOperation::CredentialUpdate, path.as_str());
            self.require(context, &path, PermissionOperation::Write)?;

            match self.versions.find_latest(&path)? {
                Some(existing) if existing.credential_type() != credential_type => {
                    return Err(CredError::Validation("error.type_mismatch".into()));
                }
                Some(_) => {}
                None => {
                    if let Some(actor) = context.actor() {
                        trail.event(AuditOperation::AclUpdate, path.as_str());
                        work.save_acl(
                            path.clone(),
                            vec![AccessControlEntry::new(actor, PermissionOperation::ALL)],
                        );
                    }
                }
            }

            let mut version = SecretVersion::new(path, credential_type);
            self.encryptor.assign(&mut version, Some(value))?;
            work.write_version(version.clone());
            Ok(version)
        })
    }

    /// Delete every version of `name`. Permission entries are kept.
    pub fn delete(
        &self,
        context: &UserContext,
        request: &RequestDescriptor,
        name: &str,
    ) -> Result<()> {
        self.guarded(context, request, STATUS_NO_CONTENT, |trail, work| {
            let path = SecretPath::parse(name)?;
            trail.event(AuditOperation::CredentialDelete, path.as_str());
            self.require(context, &path, PermissionOperation::Delete)?;

            if self.versions.find_latest(&path)?.is_none() {
                return Err(CredError::EntryNotFound);
            }
            work.delete_secret(path);
            Ok(())
        })
    }

    pub fn access_control_list(
        &self,
        context: &UserContext,
        request: &RequestDescriptor,
        name: &str,
    ) -> Result<Vec<AccessControlEntry>> {
        self.guarded(context, request, STATUS_OK, |trail, _work| {
            let path = SecretPath::parse(name)?;
            trail.event(AuditOperation::AclAccess, path.as_str());
            self.require(context, &path, PermissionOperation::ReadAcl)?;
            self.acl.access_control_list(&path)
        })
    }

    /// Grant `entries` on `name`. The secret does not need to exist yet.
    pub fn grant_permissions(
        &self,
        context: &UserContext,
        request: &RequestDescriptor,
        name: &str,
        entries: Vec<AccessControlEntry>,
    ) -> Result<()> {
        self.guarded(context, request, STATUS_OK, |trail, work| {
            let path = SecretPath::parse(name)?;
            trail.event(AuditOperation::AclUpdate, path.as_str());
            self.require(context, &path, PermissionOperation::WriteAcl)?;

            for entry in &entries {
                if entry.operations.is_empty() {
                    return Err(CredError::Validation("error.acl.missing_operations".into()));
                }
                if !self
                    .checker
                    .user_allowed_to_operate_on_actor(context, Some(&entry.actor))
                {
                    return Err(CredError::InvalidAclOperation);
                }
            }
            work.save_acl(path, entries);
            Ok(())
        })
    }

    /// Revoke `target`'s entry on `name`.
    pub fn delete_permission(
        &self,
        context: &UserContext,
        request: &RequestDescriptor,
        name: &str,
        target: &str,
    ) -> Result<()> {
        self.guarded(context, request, STATUS_NO_CONTENT, |trail, work| {
            let path = SecretPath::parse(name)?;
            trail.event(AuditOperation::AclDelete, path.as_str());
            self.acl.authorize_delete(context, &path, target)?;

            let exists = self
                .acl
                .access_control_list(&path)?
                .iter()
                .any(|entry| entry.actor == target);
            if !exists {
                return Err(CredError::EntryNotFound);
            }
            work.delete_acl(path, target);
            Ok(())
        })
    }

    /// Record a request whose credentials could not be verified.
    pub fn record_auth_failure(
        &self,
        request: &RequestDescriptor,
        claims: Option<&TokenClaims>,
        status_code: u16,
        message: &str,
    ) -> Result<()> {
        let record = build_auth_failure_audit(request, claims, status_code, message);
        info!(path = %request.path, status_code, "authentication failed");
        self.committer
            .commit(UnitOfWork::audit_only(vec![AuditRecord::AuthFailure(record)]))
    }

    /// Versions still encrypted under a provider other than the active one.
    pub fn stale_version_count(&self) -> Result<usize> {
        let active = self.encryptor.registry().active_provider()?;
        self.versions.count_by_provider_not(&active.name)
    }

    fn require(
        &self,
        context: &UserContext,
        path: &SecretPath,
        operation: PermissionOperation,
    ) -> Result<()> {
        let actor = context.actor().unwrap_or_default();
        if self.checker.has_permission(&actor, path, operation) {
            Ok(())
        } else {
            Err(CredError::EntryNotFound)
        }
    }

    fn reveal(&self, version: &SecretVersion) -> Result<RevealedSecret> {
        let value = self.encryptor.reveal(version)?.map(Zeroizing::new);
        Ok(RevealedSecret {
            uuid: version.uuid(),
            name: version.name().clone(),
            credential_type: version.credential_type(),
            created_at: version.version_created_at(),
            value,
        })
    }

    fn guarded<'a, T>(
        &self,
        context: &'a UserContext,
        request: &'a RequestDescriptor,
        success_status: u16,
        op: impl FnOnce(&mut AuditTrail<'a>, &mut UnitOfWork) -> Result<T>,
    ) -> Result<T> {
        let mut trail = AuditTrail::begin(context, request);
        let mut work = UnitOfWork::new();

        match op(&mut trail, &mut work) {
            Ok(value) => {
                let fallback = trail.clone();
                work.record_audit(trail.finish(success_status, true));
                match self.committer.commit(work) {
                    Ok(()) => Ok(value),
                    Err(err) => {
                        error!(path = %request.path, error = %err, "commit failed, recording failure only");
                        let status = err.kind().audit_status();
                        Err(self.commit_failure(fallback, status, err))
                    }
                }
            }
            Err(err) => {
                let kind = err.kind();
                if kind.is_client_error() {
                    debug!(path = %request.path, error = %err, "request rejected");
                } else {
                    error!(path = %request.path, error = %err, "request failed");
                }
                Err(self.commit_failure(trail, kind.audit_status(), err))
            }
        }
    }

    /// Commit the audit records of a failed request and hand back the error
    /// for the caller. If the audit itself is lost, that becomes the error.
    fn commit_failure(&self, trail: AuditTrail<'_>, status: u16, cause: CredError) -> CredError {
        let work = UnitOfWork::audit_only(trail.finish(status, false));
        match self.committer.commit(work) {
            Ok(()) => cause,
            Err(err) => {
                error!(error = %err, cause = %cause, "audit records for a failed request could not be committed");
                CredError::Store(format!("audit not recorded after {:?}: {err}", cause.kind()))
            }
        }
    }
}
