//! Persistence seams and the in-memory store.
//!
//! Services read through the store traits and write only through
//! [`Committer::commit`]: a [`UnitOfWork`] carries every side effect of one
//! operation together with its audit records, and is applied whole or not
//! at all.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord, AuditSink};
use crate::error::{CredError, Result};
use crate::permission::{AccessControlEntry, PermissionEntry, PermissionOperation};
use crate::secret::{SecretPath, SecretVersion};

pub trait PermissionStore: Send + Sync {
    /// Whether any entry covering `path` grants `operation` to `actor`.
    fn has_permission(
        &self,
        actor: &str,
        path: &SecretPath,
        operation: PermissionOperation,
    ) -> Result<bool>;

    /// Union of the operations granted to `actor` by entries covering `path`.
    fn allowed_operations(
        &self,
        path: &SecretPath,
        actor: &str,
    ) -> Result<BTreeSet<PermissionOperation>>;

    /// Entries stored for exactly `path`. Pattern entries are not listed.
    fn access_control_list(&self, path: &SecretPath) -> Result<Vec<AccessControlEntry>>;

    /// Merge `entries` into the entries of `path`.
    fn save_access_control_entries(
        &self,
        path: &SecretPath,
        entries: &[AccessControlEntry],
    ) -> Result<()>;

    /// Returns whether an entry was removed.
    fn delete_access_control_entry(&self, path: &SecretPath, actor: &str) -> Result<bool>;

    fn permission(&self, id: Uuid) -> Result<Option<PermissionEntry>>;
}

pub trait SecretVersionStore: Send + Sync {
    fn find_latest(&self, name: &SecretPath) -> Result<Option<SecretVersion>>;

    /// All versions of `name`, newest first.
    fn find_all(&self, name: &SecretPath) -> Result<Vec<SecretVersion>>;

    fn find_by_id(&self, id: Uuid) -> Result<Option<SecretVersion>>;

    /// Distinct secret names at or below `prefix`, sorted. Names differing
    /// only in case are listed once.
    fn find_names(&self, prefix: &str) -> Result<Vec<SecretPath>>;

    /// Number of versions whose payload was encrypted by a provider other
    /// than `provider`. Zero means every other provider may be retired.
    fn count_by_provider_not(&self, provider: &str) -> Result<usize>;
}

/// Append-only audit persistence.
pub trait AuditStore: Send + Sync {
    fn append(&self, records: Vec<AuditRecord>) -> Result<()>;
}

/// Applies a unit of work atomically.
pub trait Committer: Send + Sync {
    fn commit(&self, work: UnitOfWork) -> Result<()>;
}

/// Side effects and audit records of one operation.
///
/// Applied in a fixed order: ACL saves, ACL deletions, version writes,
/// secret deletions, then audit records. A creator's permission therefore
/// always lands before the first version of its secret.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    acl_saves: Vec<(SecretPath, Vec<AccessControlEntry>)>,
    acl_deletes: Vec<(SecretPath, String)>,
    versions: Vec<SecretVersion>,
    secret_deletes: Vec<SecretPath>,
    audit: Vec<AuditRecord>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A unit that only records an outcome.
    pub fn audit_only(records: Vec<AuditRecord>) -> Self {
        Self {
            audit: records,
            ..Self::default()
        }
    }

    pub fn save_acl(&mut self, path: SecretPath, entries: Vec<AccessControlEntry>) {
        self.acl_saves.push((path, entries));
    }

    pub fn delete_acl(&mut self, path: SecretPath, actor: impl Into<String>) {
        self.acl_deletes.push((path, actor.into()));
    }

    pub fn write_version(&mut self, version: SecretVersion) {
        self.versions.push(version);
    }

    pub fn delete_secret(&mut self, path: SecretPath) {
        self.secret_deletes.push(path);
    }

    pub fn record_audit(&mut self, records: Vec<AuditRecord>) {
        self.audit.extend(records);
    }

    pub fn has_side_effects(&self) -> bool {
        !(self.acl_saves.is_empty()
            && self.acl_deletes.is_empty()
            && self.versions.is_empty()
            && self.secret_deletes.is_empty())
    }

    pub fn audit_records(&self) -> &[AuditRecord] {
        &self.audit
    }

    pub fn versions(&self) -> &[SecretVersion] {
        &self.versions
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct State {
    /// Insertion order.
    versions: Vec<SecretVersion>,
    permissions: Vec<PermissionEntry>,
    audit: AuditLog,
}

impl State {
    fn merge_entries(&mut self, path: &SecretPath, entries: &[AccessControlEntry]) {
        for entry in entries {
            let existing = self.permissions.iter_mut().find(|p| {
                p.actor == entry.actor && p.path.eq_ignore_ascii_case(path.as_str())
            });
            match existing {
                Some(stored) => stored.operations.extend(entry.operations.iter().copied()),
                None => self.permissions.push(PermissionEntry::new(
                    path.as_str(),
                    entry.actor.clone(),
                    entry.operations.iter().copied(),
                )),
            }
        }
    }

    fn has_entry(&self, path: &SecretPath, actor: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p.actor == actor && p.path.eq_ignore_ascii_case(path.as_str()))
    }

    fn remove_entry(&mut self, path: &SecretPath, actor: &str) -> bool {
        let before = self.permissions.len();
        self.permissions
            .retain(|p| !(p.actor == actor && p.path.eq_ignore_ascii_case(path.as_str())));
        self.permissions.len() != before
    }
}

/// Every store trait over one mutex-guarded state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a permission entry as is. Pattern paths such as `/team/*`
    /// can only be added this way.
    pub fn insert_permission(&self, entry: PermissionEntry) -> Uuid {
        let id = entry.uuid;
        self.state.lock().permissions.push(entry);
        id
    }

    /// Forward every committed audit record to `sink` as well.
    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.state.lock().audit.add_forward_sink(sink);
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.state.lock().audit.iter().cloned().collect()
    }

    pub fn audit_len(&self) -> usize {
        self.state.lock().audit.len()
    }

    pub fn version_count(&self) -> usize {
        self.state.lock().versions.len()
    }

    pub fn permission_count(&self) -> usize {
        self.state.lock().permissions.len()
    }
}

impl PermissionStore for MemoryStore {
    fn has_permission(
        &self,
        actor: &str,
        path: &SecretPath,
        operation: PermissionOperation,
    ) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.permissions.iter().any(|p| {
            p.actor == actor && p.covers(path.as_str()) && p.operations.contains(&operation)
        }))
    }

    fn allowed_operations(
        &self,
        path: &SecretPath,
        actor: &str,
    ) -> Result<BTreeSet<PermissionOperation>> {
        let state = self.state.lock();
        Ok(state
            .permissions
            .iter()
            .filter(|p| p.actor == actor && p.covers(path.as_str()))
            .flat_map(|p| p.operations.iter().copied())
            .collect())
    }

    fn access_control_list(&self, path: &SecretPath) -> Result<Vec<AccessControlEntry>> {
        let state = self.state.lock();
        Ok(state
            .permissions
            .iter()
            .filter(|p| p.path.eq_ignore_ascii_case(path.as_str()))
            .map(|p| AccessControlEntry::new(p.actor.clone(), p.operations.iter().copied()))
            .collect())
    }

    fn save_access_control_entries(
        &self,
        path: &SecretPath,
        entries: &[AccessControlEntry],
    ) -> Result<()> {
        self.state.lock().merge_entries(path, entries);
        Ok(())
    }

    fn delete_access_control_entry(&self, path: &SecretPath, actor: &str) -> Result<bool> {
        Ok(self.state.lock().remove_entry(path, actor))
    }

    fn permission(&self, id: Uuid) -> Result<Option<PermissionEntry>> {
        let state = self.state.lock();
        Ok(state.permissions.iter().find(|p| p.uuid == id).cloned())
    }
}

impl SecretVersionStore for MemoryStore {
    fn find_latest(&self, name: &SecretPath) -> Result<Option<SecretVersion>> {
        Ok(self.find_all(name)?.into_iter().next())
    }

    fn find_all(&self, name: &SecretPath) -> Result<Vec<SecretVersion>> {
        let state = self.state.lock();
        let mut found: Vec<SecretVersion> = state
            .versions
            .iter()
            .rev()
            .filter(|v| v.name().matches(name))
            .cloned()
            .collect();
        // Stable sort: equal timestamps keep the later write first.
        found.sort_by(|a, b| b.version_created_at().cmp(&a.version_created_at()));
        Ok(found)
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<SecretVersion>> {
        let state = self.state.lock();
        Ok(state.versions.iter().find(|v| v.uuid() == id).cloned())
    }

    fn find_names(&self, prefix: &str) -> Result<Vec<SecretPath>> {
        let prefix = prefix.trim_end_matches('/').to_ascii_lowercase();
        let state = self.state.lock();
        let mut names: BTreeMap<String, SecretPath> = BTreeMap::new();
        for version in &state.versions {
            let key = version.name().as_str().to_ascii_lowercase();
            if key == prefix || key.starts_with(&format!("{prefix}/")) {
                names.entry(key).or_insert_with(|| version.name().clone());
            }
        }
        Ok(names.into_values().collect())
    }

    fn count_by_provider_not(&self, provider: &str) -> Result<usize> {
        let state = self.state.lock();
        Ok(state
            .versions
            .iter()
            .filter(|v| v.provider().map_or(false, |p| p != provider))
            .count())
    }
}

impl AuditStore for MemoryStore {
    fn append(&self, records: Vec<AuditRecord>) -> Result<()> {
        let mut state = self.state.lock();
        for record in records {
            state.audit.append(record);
        }
        Ok(())
    }
}

impl Committer for MemoryStore {
    fn commit(&self, work: UnitOfWork) -> Result<()> {
        let mut state = self.state.lock();

        for version in &work.versions {
            if state.versions.iter().any(|v| v.uuid() == version.uuid()) {
                return Err(CredError::Store(format!(
                    "version {} already stored",
                    version.uuid()
                )));
            }
        }
        // A revocation that finds nothing to remove lost a race with another one.
        for (path, actor) in &work.acl_deletes {
            let saved_here = work.acl_saves.iter().any(|(saved, entries)| {
                saved.matches(path) && entries.iter().any(|e| &e.actor == actor)
            });
            if !saved_here && !state.has_entry(path, actor) {
                return Err(CredError::EntryNotFound);
            }
        }

        for (path, entries) in &work.acl_saves {
            state.merge_entries(path, entries);
        }
        for (path, actor) in &work.acl_deletes {
            state.remove_entry(path, actor);
        }
        state.versions.extend(work.versions);
        for path in &work.secret_deletes {
            state.versions.retain(|v| !v.name().matches(path));
        }
        for record in work.audit {
            state.audit.append(record);
        }
        Ok(())
    }
}
