//! Secrets, their paths and their versions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::CredError;

const MIN_NAME_LEN: usize = 2;

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '-' | '_' | '/' | '.' | ':' | ',' | '(' | ')' | '[' | ']' | '+'
        )
}

/// A normalized, hierarchical secret name such as `/team/db/password`.
///
/// Always starts with `/`, never contains `//`, never ends with `/`, and
/// only uses the characters `[a-zA-Z0-9-_/.:,()[]+]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretPath(String);

impl SecretPath {
    /// Normalize and validate a raw name. A missing leading `/` is added.
    pub fn parse(raw: &str) -> Result<Self, CredError> {
        // Length is checked on the name as given, before the slash is added.
        if raw.chars().count() < MIN_NAME_LEN {
            return Err(CredError::Validation("error.missing_name".into()));
        }
        let name = if raw.starts_with('/') {
            raw.to_string()
        } else {
            format!("/{raw}")
        };

        if name.contains("//") || name.ends_with('/') {
            return Err(CredError::Validation(
                "error.credential.invalid_slash_in_name".into(),
            ));
        }
        if !name.chars().all(is_allowed_char) {
            return Err(CredError::Validation(
                "error.credential.invalid_character_in_name".into(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison, which is how stores look names up.
    pub fn matches(&self, other: &SecretPath) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SecretPath {
    type Error = CredError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<SecretPath> for String {
    fn from(path: SecretPath) -> Self {
        path.0
    }
}

/// Type tag of a secret version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Value,
    Json,
    Password,
    User,
    Certificate,
    Ssh,
    Rsa,
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Value => "value",
            Self::Json => "json",
            Self::Password => "password",
            Self::User => "user",
            Self::Certificate => "certificate",
            Self::Ssh => "ssh",
            Self::Rsa => "rsa",
        };
        f.write_str(tag)
    }
}

/// The confidential payload of a version: ciphertext and nonce travel
/// together with the name of the provider that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub provider: String,
}

/// Last plaintext assigned to one version instance.
///
/// Cloning a version does not carry the memo over: a clone is a new
/// instance and its first assignment encrypts.
#[derive(Default)]
pub(crate) struct PlaintextMemo(Option<Zeroizing<Vec<u8>>>);

impl PlaintextMemo {
    pub(crate) fn holds(&self, plaintext: &[u8]) -> bool {
        self.0.as_deref().map_or(false, |last| last.as_slice() == plaintext)
    }

    pub(crate) fn remember(&mut self, plaintext: &[u8]) {
        self.0 = Some(Zeroizing::new(plaintext.to_vec()));
    }

    pub(crate) fn clear(&mut self) {
        self.0 = None;
    }
}

impl Clone for PlaintextMemo {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl fmt::Debug for PlaintextMemo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "<remembered>" } else { "<empty>" })
    }
}

/// One version of a secret. Immutable once handed to a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretVersion {
    uuid: Uuid,
    name: SecretPath,
    credential_type: CredentialType,
    encrypted: Option<EncryptedValue>,
    created_at: DateTime<Utc>,
    #[serde(skip)]
    memo: PlaintextMemo,
}

impl SecretVersion {
    /// A fresh version with no payload, stamped now.
    pub fn new(name: SecretPath, credential_type: CredentialType) -> Self {
        Self::created_at(name, credential_type, Utc::now())
    }

    pub fn created_at(
        name: SecretPath,
        credential_type: CredentialType,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            credential_type,
            encrypted: None,
            created_at,
            memo: PlaintextMemo::default(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &SecretPath {
        &self.name
    }

    pub fn credential_type(&self) -> CredentialType {
        self.credential_type
    }

    pub fn version_created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn encrypted(&self) -> Option<&EncryptedValue> {
        self.encrypted.as_ref()
    }

    pub fn ciphertext(&self) -> Option<&[u8]> {
        self.encrypted.as_ref().map(|e| e.ciphertext.as_slice())
    }

    pub fn nonce(&self) -> Option<&[u8]> {
        self.encrypted.as_ref().map(|e| e.nonce.as_slice())
    }

    /// Name of the provider that encrypted the payload, if any.
    pub fn provider(&self) -> Option<&str> {
        self.encrypted.as_ref().map(|e| e.provider.as_str())
    }

    pub(crate) fn set_encrypted(&mut self, encrypted: Option<EncryptedValue>) {
        self.encrypted = encrypted;
    }

    pub(crate) fn memo(&self) -> &PlaintextMemo {
        &self.memo
    }

    pub(crate) fn memo_mut(&mut self) -> &mut PlaintextMemo {
        &mut self.memo
    }
}
