//! Encryption backends.
//!
//! A backend is bound to one provider identity when it is built and never
//! re-dispatches on provider type afterwards. The set of variants is closed:
//! password-derived keys held in process memory, or a key that never leaves
//! a hardware module.

use std::fmt;
use std::sync::Arc;

use crate::config::ProviderIdentity;
use crate::crypto;
use crate::error::ProviderFault;
use crate::hsm::HsmSession;
use crate::keys::DerivedKey;

/// Output of one encryption. Both halves are always present together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encrypted {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// A constructed backend for one provider.
pub enum EncryptionBackend {
    Password(PasswordBackend),
    Hardware(HardwareBackend),
}

impl EncryptionBackend {
    pub fn provider(&self) -> &ProviderIdentity {
        match self {
            Self::Password(backend) => &backend.identity,
            Self::Hardware(backend) => &backend.identity,
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Encrypted, ProviderFault> {
        match self {
            Self::Password(backend) => backend.encrypt(plaintext),
            Self::Hardware(backend) => backend.encrypt(plaintext),
        }
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, ProviderFault> {
        match self {
            Self::Password(backend) => backend.decrypt(ciphertext, nonce),
            Self::Hardware(backend) => backend.decrypt(ciphertext, nonce),
        }
    }
}

impl fmt::Debug for EncryptionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionBackend")
            .field("provider", self.provider())
            .finish_non_exhaustive()
    }
}

/// AES-256-GCM under a key derived from the provider's passphrase.
pub struct PasswordBackend {
    identity: ProviderIdentity,
    key: DerivedKey,
}

impl PasswordBackend {
    pub(crate) fn new(identity: ProviderIdentity, key: DerivedKey) -> Self {
        Self { identity, key }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Encrypted, ProviderFault> {
        let (ciphertext, nonce) = crypto::encrypt(self.key.as_bytes(), plaintext)?;
        Ok(Encrypted {
            ciphertext,
            nonce: nonce.to_vec(),
        })
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, ProviderFault> {
        crypto::decrypt(self.key.as_bytes(), nonce, ciphertext)
    }
}

/// Encryption performed inside a hardware module over a held session.
///
/// The nonce is generated locally; the key stays in the module.
pub struct HardwareBackend {
    identity: ProviderIdentity,
    key_label: String,
    session: Arc<dyn HsmSession>,
}

impl HardwareBackend {
    pub(crate) fn new(
        identity: ProviderIdentity,
        key_label: String,
        session: Arc<dyn HsmSession>,
    ) -> Self {
        Self {
            identity,
            key_label,
            session,
        }
    }

    pub fn key_label(&self) -> &str {
        &self.key_label
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Encrypted, ProviderFault> {
        let nonce = crypto::generate_nonce()?;
        let ciphertext = self.session.encrypt(&self.key_label, &nonce, plaintext)?;
        Ok(Encrypted {
            ciphertext,
            nonce: nonce.to_vec(),
        })
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, ProviderFault> {
        self.session.decrypt(&self.key_label, nonce, ciphertext)
    }
}
