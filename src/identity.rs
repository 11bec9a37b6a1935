//! Authenticated identity and request metadata.
//!
//! Both are scoped to one request and never persisted; audit records are
//! derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CredError, Result};

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// OAuth2 bearer token issued by a UAA.
    Uaa,
    /// Client certificate.
    MutualTls,
}

impl AuthMethod {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Uaa => "uaa",
            Self::MutualTls => "mutual_tls",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

const PASSWORD_GRANT: &str = "password";
const CLIENT_CREDENTIALS_GRANT: &str = "client_credentials";

/// Raw token claims, read defensively. Claims of the wrong JSON type are
/// treated as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenClaims(Map<String, Value>);

impl TokenClaims {
    pub fn new(claims: Map<String, Value>) -> Self {
        Self(claims)
    }

    pub fn from_json_str(document: &str) -> Result<Self> {
        serde_json::from_str(document)
            .map(Self)
            .map_err(|e| CredError::Validation(format!("error.invalid_token_claims: {e}")))
    }

    pub fn string(&self, claim: &str) -> Option<String> {
        self.0.get(claim).and_then(Value::as_str).map(str::to_string)
    }

    pub fn number(&self, claim: &str) -> Option<i64> {
        self.0.get(claim).and_then(Value::as_i64)
    }

    /// A list claim joined with `,`. Non-string members are skipped.
    pub fn joined(&self, claim: &str) -> Option<String> {
        let items = self.0.get(claim)?.as_array()?;
        let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
        Some(parts.join(","))
    }
}

impl From<Value> for TokenClaims {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }
}

/// The authenticated caller of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub auth_method: AuthMethod,
    pub user_id: Option<String>,
    /// Display name.
    pub user_name: Option<String>,
    pub issuer: Option<String>,
    /// Validity window in epoch seconds.
    pub valid_from: i64,
    pub valid_until: i64,
    pub client_id: Option<String>,
    pub scope: Option<String>,
    pub grant_type: Option<String>,
}

impl UserContext {
    /// Context for a verified UAA token.
    pub fn from_claims(claims: &TokenClaims) -> Self {
        Self {
            auth_method: AuthMethod::Uaa,
            user_id: claims.string("user_id"),
            user_name: claims.string("user_name"),
            issuer: claims.string("iss"),
            valid_from: claims.number("iat").unwrap_or(-1),
            valid_until: claims.number("exp").unwrap_or(-1),
            client_id: claims.string("client_id"),
            scope: claims.joined("scope"),
            grant_type: claims.string("grant_type"),
        }
    }

    /// Context for a caller presenting a client certificate.
    pub fn mutual_tls(client_id: impl Into<String>, valid_from: i64, valid_until: i64) -> Self {
        Self {
            auth_method: AuthMethod::MutualTls,
            user_id: None,
            user_name: None,
            issuer: None,
            valid_from,
            valid_until,
            client_id: Some(client_id.into()),
            scope: None,
            grant_type: None,
        }
    }

    /// The identity permission entries are keyed by.
    ///
    /// `None` when the token does not carry enough to attribute the request,
    /// for example a password grant without a user id.
    pub fn actor(&self) -> Option<String> {
        match self.auth_method {
            AuthMethod::Uaa => match self.grant_type.as_deref() {
                Some(PASSWORD_GRANT) => self.user_id.as_ref().map(|id| format!("uaa-user:{id}")),
                Some(CLIENT_CREDENTIALS_GRANT) => {
                    self.client_id.as_ref().map(|id| format!("uaa-client:{id}"))
                }
                _ => None,
            },
            AuthMethod::MutualTls => self.client_id.as_ref().map(|id| format!("mtls-app:{id}")),
        }
    }
}

/// The parts of an inbound request the audit trail records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub server_name: String,
    pub method: String,
    pub path: String,
    pub query_string: Option<String>,
    pub remote_addr: String,
    /// `X-Forwarded-For` values in arrival order.
    pub forwarded_for: Vec<String>,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query_string = Some(query.into());
        self
    }

    pub fn with_server(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn with_remote(mut self, remote_addr: impl Into<String>) -> Self {
        self.remote_addr = remote_addr.into();
        self
    }

    pub fn forwarded_by(mut self, hop: impl Into<String>) -> Self {
        self.forwarded_for.push(hop.into());
        self
    }

    /// Forwarding chain joined with `,`; empty chain gives an empty string.
    pub fn forwarded_chain(&self) -> String {
        self.forwarded_for.join(",")
    }
}
