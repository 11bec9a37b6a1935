//! Immutable audit trail.
//!
//! Three record shapes:
//! - request records, one per inbound call whatever its outcome;
//! - auth-failure records, for calls where no identity could be established;
//! - event records, one per logical action ("credential accessed"),
//!   correlated with their request record by `request_uuid`.
//!
//! Records are built by the functions in this module, collected per request
//! by [`AuditTrail`], and committed together with the operation's side
//! effects. [`AuditLog`] is the in-memory append-only log with pluggable
//! forward sinks.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::identity::{AuthMethod, RequestDescriptor, TokenClaims, UserContext};

/// Recorded on auth-failure records, where no context exists to read it from.
pub const AUTH_FAILURE_METHOD: AuthMethod = AuthMethod::Uaa;

/// Logical actions recorded by event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    CredentialAccess,
    CredentialFind,
    CredentialUpdate,
    CredentialDelete,
    AclAccess,
    AclUpdate,
    AclDelete,
}

/// One inbound call by an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAuditRecord {
    pub uuid: Uuid,
    pub auth_method: AuthMethod,
    pub actor: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub issuer: Option<String>,
    pub auth_valid_from: i64,
    pub auth_valid_until: i64,
    pub host_name: String,
    pub method: String,
    pub path: String,
    pub query_parameters: Option<String>,
    pub status_code: u16,
    pub requester_ip: String,
    pub x_forwarded_for: String,
    pub client_id: Option<String>,
    pub scope: Option<String>,
    pub grant_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One inbound call whose credentials could not be verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFailureAuditRecord {
    pub uuid: Uuid,
    pub auth_method: AuthMethod,
    pub failure_description: String,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub issuer: Option<String>,
    pub auth_valid_from: i64,
    pub auth_valid_until: i64,
    pub host_name: String,
    pub method: String,
    pub path: String,
    pub query_parameters: Option<String>,
    pub status_code: u16,
    pub requester_ip: String,
    pub x_forwarded_for: String,
    pub client_id: Option<String>,
    pub scope: Option<String>,
    pub grant_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One logical action, independent of the HTTP outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAuditRecord {
    pub uuid: Uuid,
    pub request_uuid: Option<Uuid>,
    pub operation: AuditOperation,
    pub credential_name: String,
    pub actor: Option<String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Anything that can be appended to the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    Request(RequestAuditRecord),
    AuthFailure(AuthFailureAuditRecord),
    Event(EventAuditRecord),
}

impl AuditRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Request(r) => r.timestamp,
            Self::AuthFailure(r) => r.timestamp,
            Self::Event(r) => r.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn build_request_audit(
    context: &UserContext,
    request: &RequestDescriptor,
    status_code: u16,
) -> RequestAuditRecord {
    RequestAuditRecord {
        uuid: Uuid::new_v4(),
        auth_method: context.auth_method,
        actor: context.actor(),
        user_id: context.user_id.clone(),
        user_name: context.user_name.clone(),
        issuer: context.issuer.clone(),
        auth_valid_from: context.valid_from,
        auth_valid_until: context.valid_until,
        host_name: request.server_name.clone(),
        method: request.method.clone(),
        path: request.path.clone(),
        query_parameters: request.query_string.clone(),
        status_code,
        requester_ip: request.remote_addr.clone(),
        x_forwarded_for: request.forwarded_chain(),
        client_id: context.client_id.clone(),
        scope: context.scope.clone(),
        grant_type: context.grant_type.clone(),
        timestamp: Utc::now(),
    }
}

/// Built when no identity could be established. Claims, when the token
/// could at least be decoded, are read defensively; missing timestamps are -1.
pub fn build_auth_failure_audit(
    request: &RequestDescriptor,
    claims: Option<&TokenClaims>,
    status_code: u16,
    message: &str,
) -> AuthFailureAuditRecord {
    let claim = |name: &str| claims.and_then(|c| c.string(name));
    let timestamp_claim = |name: &str| claims.and_then(|c| c.number(name)).unwrap_or(-1);

    AuthFailureAuditRecord {
        uuid: Uuid::new_v4(),
        auth_method: AUTH_FAILURE_METHOD,
        failure_description: message.to_string(),
        user_id: claim("user_id"),
        user_name: claim("user_name"),
        issuer: claim("iss"),
        auth_valid_from: timestamp_claim("iat"),
        auth_valid_until: timestamp_claim("exp"),
        host_name: request.server_name.clone(),
        method: request.method.clone(),
        path: request.path.clone(),
        query_parameters: request.query_string.clone(),
        status_code,
        requester_ip: request.remote_addr.clone(),
        x_forwarded_for: request.forwarded_chain(),
        client_id: claim("client_id"),
        scope: claims.and_then(|c| c.joined("scope")),
        grant_type: claim("grant_type"),
        timestamp: Utc::now(),
    }
}

pub fn build_event_audit(
    operation: AuditOperation,
    context: &UserContext,
    credential_name: &str,
) -> EventAuditRecord {
    EventAuditRecord {
        uuid: Uuid::new_v4(),
        request_uuid: None,
        operation,
        credential_name: credential_name.to_string(),
        actor: context.actor(),
        success: true,
        timestamp: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Per-request collection
// ---------------------------------------------------------------------------

/// Collects the event records of one request until its outcome is known.
///
/// `finish` consumes the trail, so a request produces exactly one request
/// record.
#[derive(Debug, Clone)]
pub struct AuditTrail<'a> {
    context: &'a UserContext,
    request: &'a RequestDescriptor,
    events: Vec<EventAuditRecord>,
}

impl<'a> AuditTrail<'a> {
    pub fn begin(context: &'a UserContext, request: &'a RequestDescriptor) -> Self {
        Self {
            context,
            request,
            events: Vec::new(),
        }
    }

    /// Record that `operation` was attempted on `credential_name`.
    pub fn event(&mut self, operation: AuditOperation, credential_name: &str) {
        self.events
            .push(build_event_audit(operation, self.context, credential_name));
    }

    pub fn events(&self) -> &[EventAuditRecord] {
        &self.events
    }

    /// Close the trail with the request's outcome. The request record comes
    /// first; events are stamped with its id and with `success`.
    pub fn finish(self, status_code: u16, success: bool) -> Vec<AuditRecord> {
        let request = build_request_audit(self.context, self.request, status_code);
        let request_uuid = request.uuid;

        let mut records = Vec::with_capacity(self.events.len() + 1);
        records.push(AuditRecord::Request(request));
        records.extend(self.events.into_iter().map(|mut event| {
            event.request_uuid = Some(request_uuid);
            event.success = success;
            AuditRecord::Event(event)
        }));
        records
    }
}

// ---------------------------------------------------------------------------
// Log and sinks
// ---------------------------------------------------------------------------

/// A sink that receives audit records. Implement this to forward records
/// to a file, database, or other persistent store.
pub trait AuditSink: Send {
    /// Append a record. Called once per committed record.
    fn append(&mut self, record: AuditRecord);
}

/// An append-only log of committed records.
/// Can forward records to additional sinks via `add_forward_sink`.
#[derive(Default)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records.len())
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive a copy of every record appended from now on.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append a record to the log and forward it to any attached sinks.
    pub fn append(&mut self, record: AuditRecord) {
        for sink in &mut self.forward_sinks {
            sink.append(record.clone());
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AuditRecord> {
        self.records.iter()
    }

    pub fn requests(&self) -> impl Iterator<Item = &RequestAuditRecord> {
        self.records.iter().filter_map(|r| match r {
            AuditRecord::Request(request) => Some(request),
            _ => None,
        })
    }

    pub fn events(&self) -> impl Iterator<Item = &EventAuditRecord> {
        self.records.iter().filter_map(|r| match r {
            AuditRecord::Event(event) => Some(event),
            _ => None,
        })
    }

    pub fn auth_failures(&self) -> impl Iterator<Item = &AuthFailureAuditRecord> {
        self.records.iter().filter_map(|r| match r {
            AuditRecord::AuthFailure(failure) => Some(failure),
            _ => None,
        })
    }
}

/// Writes audit records as JSON lines (one per record) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "audit record could not be serialized");
                return;
            }
        };
        if let Err(err) = writeln!(self.file, "{line}").and_then(|()| self.file.flush()) {
            warn!(error = %err, "audit record could not be written to file sink");
        }
    }
}
