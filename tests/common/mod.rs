//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use credcore::hsm::NONCE_LEN;
use credcore::{
    CoreConfig, EncryptionConfig, HsmConnector, HsmSession, HsmSettings, KeyProviderRegistry,
    PasswordSettings, ProviderConfig, ProviderFault, RetryPolicy, SoftHsm,
};

pub const PASSPHRASE: &str = "correct-horse-battery-staple";
pub const SALT: &str = "0123456789abcdef";

pub fn password_provider(name: &str) -> ProviderConfig {
    ProviderConfig::password(name, PasswordSettings::new(PASSPHRASE, SALT).with_iterations(10))
}

pub fn hsm_settings(label: &str) -> HsmSettings {
    HsmSettings {
        partition: "partition-1".into(),
        key_label: label.into(),
        create_key_if_missing: true,
    }
}

pub fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(attempts, Duration::from_millis(1))
}

/// Config with password providers named `names`, the first one active.
pub fn password_config(names: &[&str]) -> CoreConfig {
    let providers = names.iter().map(|n| password_provider(n)).collect();
    CoreConfig::new(EncryptionConfig::new(names[0], providers))
}

pub fn password_registry(names: &[&str]) -> Arc<KeyProviderRegistry> {
    Arc::new(KeyProviderRegistry::new(&password_config(names)).unwrap())
}

/// Call counters for a [`CountingHsm`].
#[derive(Debug, Default)]
pub struct HsmCalls {
    pub connects: AtomicUsize,
    pub encrypts: AtomicUsize,
    pub decrypts: AtomicUsize,
}

impl HsmCalls {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn encrypts(&self) -> usize {
        self.encrypts.load(Ordering::SeqCst)
    }

    pub fn decrypts(&self) -> usize {
        self.decrypts.load(Ordering::SeqCst)
    }
}

/// A [`SoftHsm`] that counts calls and can refuse the first
/// `failing_connects` connection attempts.
pub struct CountingHsm {
    inner: SoftHsm,
    failing_connects: usize,
    connect_delay: Duration,
    pub calls: Arc<HsmCalls>,
}

impl CountingHsm {
    pub fn new() -> Self {
        Self {
            inner: SoftHsm::new(),
            failing_connects: 0,
            connect_delay: Duration::ZERO,
            calls: Arc::new(HsmCalls::default()),
        }
    }

    pub fn unreachable() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn failing_first(failing_connects: usize) -> Self {
        Self {
            failing_connects,
            ..Self::new()
        }
    }

    /// Make every connect take `delay`, so concurrent first callers overlap.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }
}

impl HsmConnector for CountingHsm {
    fn connect(&self, settings: &HsmSettings) -> Result<Arc<dyn HsmSession>, ProviderFault> {
        let attempt = self.calls.connects.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.connect_delay);
        if attempt < self.failing_connects {
            return Err(ProviderFault::LinkUnavailable("connection refused".into()));
        }
        let session = self.inner.connect(settings)?;
        Ok(Arc::new(CountingSession {
            inner: session,
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct CountingSession {
    inner: Arc<dyn HsmSession>,
    calls: Arc<HsmCalls>,
}

impl HsmSession for CountingSession {
    fn has_key(&self, label: &str) -> Result<bool, ProviderFault> {
        self.inner.has_key(label)
    }

    fn create_key(&self, label: &str) -> Result<(), ProviderFault> {
        self.inner.create_key(label)
    }

    fn encrypt(
        &self,
        label: &str,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ProviderFault> {
        self.calls.encrypts.fetch_add(1, Ordering::SeqCst);
        self.inner.encrypt(label, nonce, plaintext)
    }

    fn decrypt(
        &self,
        label: &str,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProviderFault> {
        self.calls.decrypts.fetch_add(1, Ordering::SeqCst);
        self.inner.decrypt(label, nonce, ciphertext)
    }
}

/// Registry with a single hardware provider named `hsm` backed by `hsm`.
pub fn hardware_registry(hsm: CountingHsm, attempts: u32) -> (Arc<KeyProviderRegistry>, Arc<HsmCalls>) {
    let calls = Arc::clone(&hsm.calls);
    let config = CoreConfig::new(EncryptionConfig::new(
        "hsm",
        vec![ProviderConfig::hsm("hsm", hsm_settings("wrapping-key"))],
    ))
    .with_hsm_retry(fast_retry(attempts));
    let registry = KeyProviderRegistry::new(&config)
        .unwrap()
        .with_hsm_connector(Arc::new(hsm));
    (Arc::new(registry), calls)
}
