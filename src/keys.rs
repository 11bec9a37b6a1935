//! Key derivation and ownership for password-derived providers.
//!
//! This module owns two responsibilities:
//! 1. Deriving a data-encryption key from a configured passphrase with
//!    PBKDF2-HMAC-SHA384.
//! 2. Holding key material in a type that is opaque, non-cloneable and
//!    zeroised on drop.
//!
//! ## Derivation structure
//!
//! ```text
//! PBKDF2-HMAC-SHA384(
//!     password   = passphrase,
//!     salt       = configured salt,
//!     iterations = configured iterations,
//!     len        = 32 bytes
//! )
//! ```

use std::num::NonZeroU32;

use ring::pbkdf2;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::PasswordSettings;
use crate::crypto::KEY_LEN;
use crate::error::ProviderFault;

/// A data-encryption key.
///
/// - Not `Clone`.
/// - Zeroised on drop.
/// - Raw bytes never leave the crate.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_LEN],
}

impl DerivedKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Turns a configured passphrase into key material.
///
/// The proxy keeps its own copy of the settings so a backend can be rebuilt
/// after invalidation without going back to the configuration document.
pub struct PasswordKeyProxy {
    settings: PasswordSettings,
}

impl PasswordKeyProxy {
    pub fn new(settings: &PasswordSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    /// Derive the key. Deterministic for a given passphrase, salt and
    /// iteration count.
    pub fn derive(&self) -> Result<DerivedKey, ProviderFault> {
        let iterations =
            NonZeroU32::new(self.settings.iterations).ok_or(ProviderFault::InvalidKey)?;

        let mut bytes = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA384,
            iterations,
            self.settings.salt.as_bytes(),
            self.settings.passphrase.as_bytes(),
            &mut bytes,
        );
        Ok(DerivedKey { bytes })
    }
}
