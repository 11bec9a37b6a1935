//! Transparent encryption of secret version payloads.
//!
//! Writes go through the active provider; reads go through whichever
//! provider the version records, which may have stopped being active long
//! ago.

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{CredError, Result};
use crate::registry::KeyProviderRegistry;
use crate::secret::{EncryptedValue, SecretVersion};

#[derive(Clone)]
pub struct Encryptor {
    registry: Arc<KeyProviderRegistry>,
}

impl Encryptor {
    pub fn new(registry: Arc<KeyProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &KeyProviderRegistry {
        &self.registry
    }

    /// Set the plaintext of `version`.
    ///
    /// - `None` clears ciphertext, nonce and provider.
    /// - The plaintext last assigned to this same instance is a no-op; the
    ///   backend is not called again.
    /// - Anything else is encrypted under the active provider.
    pub fn assign(&self, version: &mut SecretVersion, plaintext: Option<&[u8]>) -> Result<()> {
        let Some(plaintext) = plaintext else {
            version.set_encrypted(None);
            version.memo_mut().clear();
            return Ok(());
        };

        if version.encrypted().is_some() && version.memo().holds(plaintext) {
            return Ok(());
        }

        let backend = self.registry.active()?;
        let sealed = backend.encrypt(plaintext)?;
        debug!(
            version = %version.uuid(),
            provider = %backend.provider().name,
            "encrypted version payload"
        );

        version.set_encrypted(Some(EncryptedValue {
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            provider: backend.provider().name.clone(),
        }));
        version.memo_mut().remember(plaintext);
        Ok(())
    }

    /// Decrypt the payload of `version`, or `None` when it carries none.
    ///
    /// Fails with `KeyNotFound` when the recorded provider has been removed
    /// from the configuration.
    pub fn reveal(&self, version: &SecretVersion) -> Result<Option<Vec<u8>>> {
        let Some(encrypted) = version.encrypted() else {
            return Ok(None);
        };

        let backend = self
            .registry
            .resolve_named(&encrypted.provider)
            .map_err(|err| {
                if let CredError::KeyNotFound { provider } = &err {
                    error!(
                        version = %version.uuid(),
                        provider = %provider,
                        "version encrypted by a provider that is no longer configured"
                    );
                }
                err
            })?;

        let plaintext = backend.decrypt(&encrypted.ciphertext, &encrypted.nonce)?;
        Ok(Some(plaintext))
    }
}
