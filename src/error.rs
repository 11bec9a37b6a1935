//! Error types for credcore.
//!
//! Every operation returns [`CredError`]. Callers branch on
//! [`CredError::kind`] rather than on individual variants: the kind decides
//! whether the failure is the caller's fault, which status the audit trail
//! records, and which message leaves the service.
//!
//! The `Display` of the client-facing variants is the stable error code
//! (`error.credential.invalid_access`, ...). Permission failures and missing
//! resources share one variant so the two are indistinguishable.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CredError>;

/// Text returned for both "does not exist" and "not allowed".
pub const NOT_FOUND_MESSAGE: &str = "The request could not be completed because the credential does not exist or you do not have sufficient authorization.";

/// Text returned when a stored version needs a provider that is no longer configured.
pub const KEY_NOT_FOUND_MESSAGE: &str = "The credential could not be accessed with the provided encryption keys. You must update your deployment configuration to continue.";

const INVALID_ACL_MESSAGE: &str =
    "Modification of access control for the authenticated user is not allowed. Please contact an administrator.";

const SERVER_ERROR_MESSAGE: &str =
    "An application error occurred. Please contact your administrator.";

/// A failure reported by an encryption backend or the hardware module behind it.
///
/// Never retried within a request: the retry policy only applies while a
/// hardware backend is being constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderFault {
    /// The hardware module could not be reached or the session dropped.
    #[error("hardware link unavailable: {0}")]
    LinkUnavailable(String),

    /// The hardware module answered but refused the operation.
    #[error("hardware module rejected the request: {0}")]
    Rejected(String),

    /// Key material was malformed or could not be derived.
    #[error("invalid key material")]
    InvalidKey,

    #[error("encryption failed")]
    EncryptionFailure,

    /// Wrong key, tampered ciphertext or a bad nonce.
    #[error("decryption failed")]
    DecryptionFailure,

    #[error("randomness source failed")]
    RandomnessFailure,
}

/// The single error type for all credcore operations.
#[derive(Debug, Error)]
pub enum CredError {
    /// Malformed path, request shape or configuration. Carries the error code.
    #[error("{0}")]
    Validation(String),

    /// The entry does not exist, or the caller may not see it.
    #[error("error.credential.invalid_access")]
    EntryNotFound,

    /// The caller tried to change its own access control entry.
    #[error("error.acl.invalid_update_operation")]
    InvalidAclOperation,

    /// A version was encrypted by a provider that is no longer configured.
    #[error("error.missing_encryption_key")]
    KeyNotFound { provider: String },

    /// A backend could not be built for the named provider.
    #[error("encryption provider {provider} could not be constructed: {reason}")]
    ProviderConstruction { provider: String, reason: String },

    #[error(transparent)]
    Provider(#[from] ProviderFault),

    /// A persistence collaborator failed.
    #[error("storage error: {0}")]
    Store(String),
}

/// The taxonomy callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidAclOperation,
    KeyNotFound,
    ProviderConstruction,
    ProviderFault,
    Store,
}

impl ErrorKind {
    /// Client errors are recovered at the request boundary; everything else
    /// is reported as a server fault.
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            Self::Validation | Self::NotFound | Self::InvalidAclOperation
        )
    }

    /// Status code recorded in the request audit record for this outcome.
    pub fn audit_status(self) -> u16 {
        match self {
            Self::Validation | Self::InvalidAclOperation => 400,
            Self::NotFound => 404,
            Self::KeyNotFound | Self::ProviderConstruction | Self::ProviderFault | Self::Store => {
                500
            }
        }
    }
}

impl CredError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::EntryNotFound => ErrorKind::NotFound,
            Self::InvalidAclOperation => ErrorKind::InvalidAclOperation,
            Self::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            Self::ProviderConstruction { .. } => ErrorKind::ProviderConstruction,
            Self::Provider(_) => ErrorKind::ProviderFault,
            Self::Store(_) => ErrorKind::Store,
        }
    }

    /// The message a client sees. Server faults are reduced to a generic
    /// text, except for a missing encryption key which the operator must act on.
    pub fn client_message(&self) -> String {
        match self {
            Self::Validation(code) => validation_message(code).to_string(),
            Self::EntryNotFound => NOT_FOUND_MESSAGE.to_string(),
            Self::InvalidAclOperation => INVALID_ACL_MESSAGE.to_string(),
            Self::KeyNotFound { .. } => KEY_NOT_FOUND_MESSAGE.to_string(),
            Self::ProviderConstruction { .. } | Self::Provider(_) | Self::Store(_) => {
                SERVER_ERROR_MESSAGE.to_string()
            }
        }
    }
}

fn validation_message(code: &str) -> &str {
    match code {
        "error.missing_name" => {
            "A credential name must be provided. Please validate your input and retry your request."
        }
        "error.credential.invalid_slash_in_name" => {
            "A credential name cannot end with a '/' character or contain '//'. Credential names should be in the form of /[path]/[name] or [path]/[name]. Please update and retry your request."
        }
        "error.credential.invalid_character_in_name" => {
            "A credential name can only include alpha, numeric, hyphen, underscore, slash, period, colon, comma, parentheses, square brackets or plus characters."
        }
        "error.type_mismatch" => {
            "The credential type cannot be modified. Please delete the credential if you wish to create it with a different type."
        }
        other => other,
    }
}
