//! End-to-end behaviour of the guarded secret service.

mod common;

use std::sync::Arc;

use common::{password_config, password_registry};
use credcore::audit::AuditRecord;
use credcore::store::{Committer, UnitOfWork};
use credcore::{
    CredError, CredentialType, ErrorKind, MemoryStore, PermissionEntry, PermissionOperation,
    RequestDescriptor, Result, SecretService, Stores, TokenClaims, UserContext,
};
use serde_json::json;

/// Refuses any unit of work that carries side effects.
struct ReadOnlyCommitter {
    inner: Arc<MemoryStore>,
}

impl Committer for ReadOnlyCommitter {
    fn commit(&self, work: UnitOfWork) -> Result<()> {
        if work.has_side_effects() {
            return Err(CredError::Store("database is read-only".into()));
        }
        self.inner.commit(work)
    }
}

/// Refuses everything, audit included.
struct BrokenCommitter;

impl Committer for BrokenCommitter {
    fn commit(&self, _work: UnitOfWork) -> Result<()> {
        Err(CredError::Store("disk full".into()))
    }
}

fn user(id: &str) -> UserContext {
    UserContext::from_claims(&TokenClaims::from(json!({
        "user_id": id,
        "user_name": id,
        "grant_type": "password",
        "iat": 1_700_000_000,
        "exp": 1_700_003_600,
    })))
}

fn get() -> RequestDescriptor {
    RequestDescriptor::new("GET", "/api/v1/data").with_remote("127.0.0.1")
}

fn put() -> RequestDescriptor {
    RequestDescriptor::new("PUT", "/api/v1/data").with_remote("127.0.0.1")
}

/// Store where alice may write anywhere under `/team/`.
fn team_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_permission(PermissionEntry::new(
        "/team/*",
        "uaa-user:alice",
        [PermissionOperation::Write],
    ));
    store
}

fn service_over(store: &Arc<MemoryStore>, providers: &[&str]) -> SecretService {
    SecretService::new(
        &password_config(providers),
        password_registry(providers),
        Stores::memory(store),
    )
}

fn requests(store: &MemoryStore) -> Vec<(u16, String)> {
    store
        .audit_records()
        .into_iter()
        .filter_map(|r| match r {
            AuditRecord::Request(req) => Some((req.status_code, req.method)),
            _ => None,
        })
        .collect()
}

fn events(store: &MemoryStore) -> Vec<(String, bool)> {
    store
        .audit_records()
        .into_iter()
        .filter_map(|r| match r {
            AuditRecord::Event(e) => Some((e.credential_name, e.success)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_creator_gets_full_access_in_same_commit() {
    let store = team_store();
    let service = service_over(&store, &["primary"]);
    let alice = user("alice");

    let version = service
        .set(&alice, &put(), "team/db/password", CredentialType::Password, b"hunter2")
        .unwrap();
    assert_eq!(version.name().as_str(), "/team/db/password");
    assert_eq!(version.provider(), Some("primary"));

    let ops = service
        .acl()
        .allowed_operations(version.name(), "uaa-user:alice")
        .unwrap();
    assert_eq!(ops.len(), PermissionOperation::ALL.len());

    let read = service
        .get_by_name(&alice, &get(), "/team/db/password", true)
        .unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].value.as_deref().map(Vec::as_slice), Some(&b"hunter2"[..]));

    assert_eq!(requests(&store), [(200, "PUT".to_string()), (200, "GET".to_string())]);
    assert!(events(&store).iter().all(|(_, success)| *success));
}

#[test]
fn test_denied_read_is_not_found_with_audit_and_no_decrypt() {
    let store = team_store();
    let service = service_over(&store, &["primary"]);
    service
        .set(&user("alice"), &put(), "/team/key", CredentialType::Value, b"v1")
        .unwrap();

    let err = service
        .get_by_name(&user("mallory"), &get(), "/team/key", true)
        .unwrap_err();
    assert!(matches!(err, CredError::EntryNotFound));

    let missing = service
        .get_by_name(&user("alice"), &get(), "/team/nothing-here", true)
        .unwrap_err();
    assert_eq!(err.client_message(), missing.client_message());

    let statuses: Vec<u16> = requests(&store).into_iter().map(|(s, _)| s).collect();
    assert_eq!(statuses, [200, 404, 404]);
    // The write recorded two events; the denied read is the third.
    assert_eq!(
        events(&store)[2],
        ("/team/key".to_string(), false),
        "the denied access is still recorded as an event"
    );
}

#[test]
fn test_denied_write_has_no_side_effects() {
    let store = team_store();
    let service = service_over(&store, &["primary"]);

    let err = service
        .set(&user("mallory"), &put(), "/team/key", CredentialType::Value, b"x")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(store.version_count(), 0);
    assert_eq!(store.permission_count(), 1);
    assert_eq!(requests(&store), [(404, "PUT".to_string())]);
}

#[test]
fn test_failed_commit_leaves_no_partial_state() {
    let store = team_store();
    let stores = Stores {
        permissions: store.clone(),
        versions: store.clone(),
        committer: Arc::new(ReadOnlyCommitter {
            inner: store.clone(),
        }),
    };
    let service = SecretService::new(&password_config(&["primary"]), password_registry(&["primary"]), stores);

    let err = service
        .set(&user("alice"), &put(), "/team/key", CredentialType::Value, b"x")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Store);

    // Neither the version nor the creator's permission landed.
    assert_eq!(store.version_count(), 0);
    assert_eq!(store.permission_count(), 1);
    // The failure itself is audited.
    assert_eq!(requests(&store), [(500, "PUT".to_string())]);
    assert!(events(&store).iter().all(|(_, success)| !success));
}

#[test]
fn test_missing_key_is_audited_as_server_error() {
    let store = team_store();
    let writer = service_over(&store, &["retired"]);
    writer
        .set(&user("alice"), &put(), "/team/key", CredentialType::Value, b"old")
        .unwrap();

    let reader = service_over(&store, &["current"]);
    assert_eq!(reader.stale_version_count().unwrap(), 1);

    let err = reader
        .get_by_name(&user("alice"), &get(), "/team/key", true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    assert_eq!(requests(&store).last().unwrap().0, 500);
}

#[test]
fn test_validation_and_type_mismatch_are_client_errors() {
    let store = team_store();
    let service = service_over(&store, &["primary"]);
    let alice = user("alice");

    let err = service
        .set(&alice, &put(), "/team//key", CredentialType::Value, b"x")
        .unwrap_err();
    assert_eq!(err.to_string(), "error.credential.invalid_slash_in_name");

    service
        .set(&alice, &put(), "/team/key", CredentialType::Value, b"x")
        .unwrap();
    let err = service
        .set(&alice, &put(), "/team/key", CredentialType::Json, b"{}")
        .unwrap_err();
    assert_eq!(err.to_string(), "error.type_mismatch");
    assert!(err.kind().is_client_error());

    let statuses: Vec<u16> = requests(&store).into_iter().map(|(s, _)| s).collect();
    assert_eq!(statuses, [400, 200, 400]);
    assert_eq!(store.version_count(), 1);
}

#[test]
fn test_history_by_name_and_id() {
    let store = team_store();
    let service = service_over(&store, &["primary"]);
    let alice = user("alice");

    let first = service
        .set(&alice, &put(), "/team/rotating", CredentialType::Value, b"one")
        .unwrap();
    service
        .set(&alice, &put(), "/team/rotating", CredentialType::Value, b"two")
        .unwrap();

    let all = service
        .get_by_name(&alice, &get(), "/team/rotating", false)
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].value.as_deref().map(Vec::as_slice), Some(&b"two"[..]));

    let by_id = service.get_by_id(&alice, &get(), first.uuid()).unwrap();
    assert_eq!(by_id.value.as_deref().map(Vec::as_slice), Some(&b"one"[..]));

    let err = service
        .get_by_id(&user("mallory"), &get(), first.uuid())
        .unwrap_err();
    assert!(matches!(err, CredError::EntryNotFound));
}

#[test]
fn test_find_lists_only_readable_names() {
    let store = team_store();
    let service = service_over(&store, &["primary"]);
    service
        .set(&user("alice"), &put(), "/team/a", CredentialType::Value, b"a")
        .unwrap();
    service
        .set(&user("alice"), &put(), "/team/b", CredentialType::Value, b"b")
        .unwrap();
    store.insert_permission(PermissionEntry::new(
        "/team/a",
        "uaa-user:bob",
        [PermissionOperation::Read],
    ));

    let names = service.find_by_path(&user("bob"), &get(), "team").unwrap();
    let names: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
    assert_eq!(names, ["/team/a"]);
    assert_eq!(
        service.find_by_path(&user("alice"), &get(), "/team").unwrap().len(),
        2
    );
}

#[test]
fn test_delete_removes_versions_and_keeps_permissions() {
    let store = team_store();
    let service = service_over(&store, &["primary"]);
    let alice = user("alice");
    service
        .set(&alice, &put(), "/team/gone", CredentialType::Value, b"x")
        .unwrap();

    let del = RequestDescriptor::new("DELETE", "/api/v1/data");
    service.delete(&alice, &del, "/team/gone").unwrap();
    assert_eq!(store.version_count(), 0);
    assert_eq!(store.permission_count(), 2);

    let err = service.delete(&alice, &del, "/team/gone").unwrap_err();
    assert!(matches!(err, CredError::EntryNotFound));
    let statuses: Vec<u16> = requests(&store).into_iter().map(|(s, _)| s).collect();
    assert_eq!(statuses, [200, 204, 404]);
}

#[test]
fn test_disabled_enforcement_allows_everyone() {
    let store = Arc::new(MemoryStore::new());
    let config = password_config(&["primary"]).with_enforcement(false);
    let service = SecretService::new(&config, password_registry(&["primary"]), Stores::memory(&store));

    service
        .set(&user("anyone"), &put(), "/open/key", CredentialType::Value, b"x")
        .unwrap();
    let read = service
        .get_by_name(&user("someone-else"), &get(), "/open/key", true)
        .unwrap();
    assert_eq!(read.len(), 1);
}

#[test]
fn test_auth_failure_is_recorded() {
    let store = Arc::new(MemoryStore::new());
    let service = service_over(&store, &["primary"]);
    let claims = TokenClaims::from(json!({ "user_id": "u-1", "exp": 1 }));

    service
        .record_auth_failure(&get(), Some(&claims), 401, "token expired")
        .unwrap();

    let records = store.audit_records();
    assert_eq!(records.len(), 1);
    let AuditRecord::AuthFailure(failure) = &records[0] else {
        panic!("expected an auth failure record");
    };
    assert_eq!(failure.user_id.as_deref(), Some("u-1"));
    assert_eq!(failure.auth_valid_until, 1);
    assert_eq!(failure.auth_valid_from, -1);
}

#[test]
fn test_acl_read_needs_read_acl() {
    let store = team_store();
    let service = service_over(&store, &["primary"]);
    service
        .set(&user("alice"), &put(), "/team/listed", CredentialType::Value, b"x")
        .unwrap();

    let acl = service
        .access_control_list(&user("alice"), &get(), "/team/listed")
        .unwrap();
    assert_eq!(acl.len(), 1);
    assert_eq!(acl[0].actor, "uaa-user:alice");

    let err = service
        .access_control_list(&user("mallory"), &get(), "/team/listed")
        .unwrap_err();
    assert!(matches!(err, CredError::EntryNotFound));
}

#[test]
fn test_lost_audit_is_reported_as_store_failure() {
    let store = team_store();
    let stores = Stores {
        committer: Arc::new(BrokenCommitter),
        ..Stores::memory(&store)
    };
    let service = SecretService::new(&password_config(&["primary"]), password_registry(&["primary"]), stores);

    // A plain miss would be EntryNotFound; losing its audit outranks that.
    let err = service
        .get_by_name(&user("alice"), &get(), "/team/nothing-here", true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Store);
    assert!(err.to_string().contains("audit not recorded"));
    assert_eq!(store.audit_len(), 0);
}

#[test]
fn test_revoking_an_already_revoked_entry_is_not_found() {
    let shared = |actor: &str, ops: &[PermissionOperation]| {
        PermissionEntry::new("/team/shared", actor, ops.iter().copied())
    };
    let live = team_store();
    live.insert_permission(shared("uaa-user:alice", &PermissionOperation::ALL));

    // Another request already removed bob; this service still sees him.
    let stale = Arc::new(MemoryStore::new());
    stale.insert_permission(shared("uaa-user:alice", &PermissionOperation::ALL));
    stale.insert_permission(shared("uaa-user:bob", &[PermissionOperation::Read]));
    let stores = Stores {
        permissions: stale,
        ..Stores::memory(&live)
    };
    let service = SecretService::new(&password_config(&["primary"]), password_registry(&["primary"]), stores);

    let del = RequestDescriptor::new("DELETE", "/api/v1/permissions");
    let err = service
        .delete_permission(&user("alice"), &del, "/team/shared", "uaa-user:bob")
        .unwrap_err();
    assert!(matches!(err, CredError::EntryNotFound));
    assert_eq!(requests(&live), [(404, "DELETE".to_string())]);
    assert_eq!(live.permission_count(), 2);
}
