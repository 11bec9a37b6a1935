//! Hardware security module boundary.
//!
//! The core never talks to a vendor library directly. A host wires in an
//! [`HsmConnector`] that opens sessions against a partition; the hardware
//! backend performs every encrypt and decrypt through the [`HsmSession`] it
//! was built with. [`SoftHsm`] is an in-process implementation for
//! development and tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::config::HsmSettings;
use crate::crypto::{self, KEY_LEN};
use crate::error::ProviderFault;

pub use crate::crypto::NONCE_LEN;

/// Opens sessions against a hardware module.
///
/// `connect` may block on network I/O and may fail transiently; the registry
/// wraps it in the configured retry policy.
pub trait HsmConnector: Send + Sync {
    fn connect(&self, settings: &HsmSettings) -> Result<Arc<dyn HsmSession>, ProviderFault>;
}

/// A stateful session with one partition.
pub trait HsmSession: Send + Sync {
    /// Whether the partition holds a key with this label.
    fn has_key(&self, label: &str) -> Result<bool, ProviderFault>;

    /// Generate a new key inside the module.
    fn create_key(&self, label: &str) -> Result<(), ProviderFault>;

    /// Encrypt under the labelled key. Returns ciphertext with tag appended.
    fn encrypt(
        &self,
        label: &str,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ProviderFault>;

    fn decrypt(&self, label: &str, nonce: &[u8], ciphertext: &[u8])
        -> Result<Vec<u8>, ProviderFault>;
}

type Partition = Arc<Mutex<HashMap<String, Zeroizing<[u8; KEY_LEN]>>>>;

/// Software stand-in for a hardware module.
///
/// Partitions are created on first connect and outlive individual sessions,
/// so keys survive a backend being invalidated and rebuilt.
#[derive(Default, Clone)]
pub struct SoftHsm {
    partitions: Arc<Mutex<HashMap<String, Partition>>>,
}

impl SoftHsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-provision a key, as an operator would before enabling a provider.
    pub fn provision_key(&self, partition: &str, label: &str) -> Result<(), ProviderFault> {
        self.partition(partition).lock().insert(
            label.to_string(),
            Zeroizing::new(crypto::generate_random_key()?),
        );
        Ok(())
    }

    fn partition(&self, name: &str) -> Partition {
        Arc::clone(
            self.partitions
                .lock()
                .entry(name.to_string())
                .or_default(),
        )
    }
}

impl HsmConnector for SoftHsm {
    fn connect(&self, settings: &HsmSettings) -> Result<Arc<dyn HsmSession>, ProviderFault> {
        Ok(Arc::new(SoftHsmSession {
            keys: self.partition(&settings.partition),
        }))
    }
}

struct SoftHsmSession {
    keys: Partition,
}

impl SoftHsmSession {
    fn with_key<T>(
        &self,
        label: &str,
        op: impl FnOnce(&[u8; KEY_LEN]) -> Result<T, ProviderFault>,
    ) -> Result<T, ProviderFault> {
        let keys = self.keys.lock();
        let key = keys
            .get(label)
            .ok_or_else(|| ProviderFault::Rejected(format!("no key labelled {label}")))?;
        op(&**key)
    }
}

impl HsmSession for SoftHsmSession {
    fn has_key(&self, label: &str) -> Result<bool, ProviderFault> {
        Ok(self.keys.lock().contains_key(label))
    }

    fn create_key(&self, label: &str) -> Result<(), ProviderFault> {
        let key = Zeroizing::new(crypto::generate_random_key()?);
        self.keys.lock().entry(label.to_string()).or_insert(key);
        Ok(())
    }

    fn encrypt(
        &self,
        label: &str,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ProviderFault> {
        self.with_key(label, |key| crypto::encrypt_with_nonce(key, nonce, plaintext))
    }

    fn decrypt(
        &self,
        label: &str,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProviderFault> {
        self.with_key(label, |key| crypto::decrypt(key, nonce, ciphertext))
    }
}
