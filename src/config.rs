//! Configuration consumed by the core.
//!
//! Loading the document (files, environment, bootstrap) is the host's job;
//! this module only defines the shape, parses it from JSON and validates it.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CredError, Result};
pub use crate::retry::RetryPolicy;

/// Shortest passphrase accepted for a password-derived provider.
pub const MIN_PASSPHRASE_LEN: usize = 20;

/// Shortest salt accepted for a password-derived provider, in bytes.
pub const MIN_SALT_LEN: usize = 16;

/// PBKDF2 iteration count used when the document does not set one.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Top-level configuration for the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// When false, every permission check passes.
    #[serde(default = "enforce_by_default")]
    pub enforce_permissions: bool,
    pub encryption: EncryptionConfig,
    /// Applied to hardware connection establishment only.
    #[serde(default)]
    pub hsm_retry: RetryPolicy,
}

fn enforce_by_default() -> bool {
    true
}

/// The configured key providers and which one encrypts new values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Name of the provider used for new encryptions.
    pub active: String,
    pub providers: Vec<ProviderConfig>,
}

/// Provider type tag.
///
/// Unknown tags parse into `Unsupported` so that a document naming a newer
/// backend still loads and the failure surfaces when that provider is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Hsm,
    Password,
    External,
    Unsupported(String),
}

impl ProviderKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "hsm" => Self::Hsm,
            "password" | "internal" => Self::Password,
            "external" | "kms-plugin" => Self::External,
            _ => Self::Unsupported(tag.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Hsm => "hsm",
            Self::Password => "password",
            Self::External => "external",
            Self::Unsupported(tag) => tag,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl Serialize for ProviderKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for ProviderKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::from_tag(&tag))
    }
}

/// Name plus type of a key provider. Stored on nothing; versions keep only the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderIdentity {
    pub name: String,
    pub kind: ProviderKind,
}

impl fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// One configured provider with its type-specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hsm: Option<HsmSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<PasswordSettings>,
}

impl ProviderConfig {
    pub fn password(name: impl Into<String>, settings: PasswordSettings) -> Self {
        Self {
            name: name.into(),
            kind: ProviderKind::Password,
            hsm: None,
            password: Some(settings),
        }
    }

    pub fn hsm(name: impl Into<String>, settings: HsmSettings) -> Self {
        Self {
            name: name.into(),
            kind: ProviderKind::Hsm,
            hsm: Some(settings),
            password: None,
        }
    }

    pub fn identity(&self) -> ProviderIdentity {
        ProviderIdentity {
            name: self.name.clone(),
            kind: self.kind.clone(),
        }
    }
}

/// Connection parameters for a hardware-backed provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmSettings {
    pub partition: String,
    /// Label of the wrapping key inside the partition.
    pub key_label: String,
    /// Create the key when the partition does not hold it yet.
    #[serde(default)]
    pub create_key_if_missing: bool,
}

/// Derivation parameters for a password-derived provider. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PasswordSettings {
    pub passphrase: String,
    pub salt: String,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

fn default_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

impl PasswordSettings {
    pub fn new(passphrase: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            salt: salt.into(),
            iterations: DEFAULT_ITERATIONS,
        }
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }
}

impl fmt::Debug for PasswordSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordSettings")
            .field("passphrase", &"<redacted>")
            .field("salt", &self.salt)
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl CoreConfig {
    pub fn new(encryption: EncryptionConfig) -> Self {
        Self {
            enforce_permissions: true,
            encryption,
            hsm_retry: RetryPolicy::default(),
        }
    }

    pub fn with_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_permissions = enforce;
        self
    }

    pub fn with_hsm_retry(mut self, retry: RetryPolicy) -> Self {
        self.hsm_retry = retry;
        self
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(document: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(document)
            .map_err(|e| CredError::Validation(format!("error.config.malformed: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the registry relies on.
    pub fn validate(&self) -> Result<()> {
        self.encryption.validate()?;
        if self.hsm_retry.attempts == 0 {
            return Err(invalid("error.config.retry_attempts"));
        }
        Ok(())
    }
}

impl EncryptionConfig {
    pub fn new(active: impl Into<String>, providers: Vec<ProviderConfig>) -> Self {
        Self {
            active: active.into(),
            providers,
        }
    }

    /// Look a provider up by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn active_provider(&self) -> Option<&ProviderConfig> {
        self.provider(&self.active)
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(invalid("error.config.no_providers"));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(invalid("error.config.provider_name"));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(invalid("error.config.duplicate_provider"));
            }
            provider.validate()?;
        }

        if self.active_provider().is_none() {
            return Err(invalid("error.config.active_provider_missing"));
        }
        Ok(())
    }
}

impl ProviderConfig {
    fn validate(&self) -> Result<()> {
        match self.kind {
            ProviderKind::Hsm => {
                let hsm = self
                    .hsm
                    .as_ref()
                    .ok_or_else(|| invalid("error.config.hsm_settings_missing"))?;
                if hsm.key_label.is_empty() {
                    return Err(invalid("error.config.hsm_key_label"));
                }
            }
            ProviderKind::Password => {
                let password = self
                    .password
                    .as_ref()
                    .ok_or_else(|| invalid("error.config.password_settings_missing"))?;
                if password.passphrase.chars().count() < MIN_PASSPHRASE_LEN {
                    return Err(invalid("error.config.passphrase_too_short"));
                }
                if password.salt.len() < MIN_SALT_LEN {
                    return Err(invalid("error.config.salt_too_short"));
                }
                if password.iterations == 0 {
                    return Err(invalid("error.config.iterations"));
                }
            }
            // Accepted here; the registry refuses to build them.
            ProviderKind::External | ProviderKind::Unsupported(_) => {}
        }
        Ok(())
    }
}

fn invalid(code: &str) -> CredError {
    CredError::Validation(code.to_string())
}
