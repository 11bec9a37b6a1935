//! Key provider registry.
//!
//! Owns every encryption backend in the process. A backend is built on first
//! use of its provider identity (name plus type) and handed out as a shared
//! `Arc` afterwards.
//!
//! Each identity has its own slot. Concurrent first callers for the same
//! identity wait for one construction and share its outcome, failure
//! included, while callers for other providers proceed. The table lock is
//! only held to fetch or insert a slot, never across construction.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{EncryptionBackend, HardwareBackend, PasswordBackend};
use crate::config::{
    CoreConfig, EncryptionConfig, ProviderConfig, ProviderIdentity, ProviderKind, RetryPolicy,
};
use crate::error::{CredError, Result};
use crate::hsm::HsmConnector;
use crate::keys::PasswordKeyProxy;

/// Construction state of one provider identity.
#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    settled: Condvar,
}

#[derive(Default)]
struct SlotState {
    backend: Option<Arc<EncryptionBackend>>,
    building: bool,
    /// Bumped every time a construction starts.
    round: u64,
    /// Round and reason of the last failed construction.
    failure: Option<(u64, String)>,
}

pub struct KeyProviderRegistry {
    encryption: EncryptionConfig,
    retry: RetryPolicy,
    hsm: Option<Arc<dyn HsmConnector>>,
    slots: Mutex<HashMap<ProviderIdentity, Arc<Slot>>>,
}

impl fmt::Debug for KeyProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers: Vec<&str> = self
            .encryption
            .providers
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        f.debug_struct("KeyProviderRegistry")
            .field("active", &self.encryption.active)
            .field("providers", &providers)
            .field("slots", &self.slots.lock().len())
            .finish_non_exhaustive()
    }
}

impl KeyProviderRegistry {
    /// Build a registry over a validated configuration. Nothing is
    /// constructed until the first `resolve`.
    pub fn new(config: &CoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            encryption: config.encryption.clone(),
            retry: config.hsm_retry,
            hsm: None,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Attach the connector used for hardware-backed providers.
    pub fn with_hsm_connector(mut self, connector: Arc<dyn HsmConnector>) -> Self {
        self.hsm = Some(connector);
        self
    }

    /// The provider new values are encrypted under.
    pub fn active_provider(&self) -> Result<&ProviderConfig> {
        self.encryption
            .active_provider()
            .ok_or_else(|| CredError::KeyNotFound {
                provider: self.encryption.active.clone(),
            })
    }

    /// Resolve the backend of the active provider.
    pub fn active(&self) -> Result<Arc<EncryptionBackend>> {
        let provider = self.active_provider()?;
        self.resolve(provider)
    }

    /// Resolve a provider by the name recorded on a version.
    ///
    /// A name that is no longer configured is a `KeyNotFound`.
    pub fn resolve_named(&self, name: &str) -> Result<Arc<EncryptionBackend>> {
        let provider = self
            .encryption
            .provider(name)
            .ok_or_else(|| CredError::KeyNotFound {
                provider: name.to_string(),
            })?;
        self.resolve(provider)
    }

    /// Return the backend for `provider`, constructing it on first use.
    ///
    /// A caller that arrives while a construction is in flight gets that
    /// construction's result. Failures are not cached: a call made after a
    /// failed construction starts a new one.
    pub fn resolve(&self, provider: &ProviderConfig) -> Result<Arc<EncryptionBackend>> {
        let slot = self.slot(provider.identity());
        let mut state = slot.state.lock();
        loop {
            if let Some(backend) = &state.backend {
                return Ok(Arc::clone(backend));
            }
            if !state.building {
                break;
            }
            let awaited = state.round;
            while state.building && state.round == awaited {
                slot.settled.wait(&mut state);
            }
            if let Some((round, reason)) = &state.failure {
                if *round == awaited {
                    return Err(construction_fault(provider, reason.clone()));
                }
            }
        }

        state.building = true;
        state.round += 1;
        let round = state.round;
        let built = MutexGuard::unlocked(&mut state, || self.construct(provider).map(Arc::new));
        state.building = false;
        let result = match built {
            Ok(backend) => {
                state.backend = Some(Arc::clone(&backend));
                state.failure = None;
                Ok(backend)
            }
            Err(err) => {
                state.failure = Some((round, failure_reason(&err)));
                Err(err)
            }
        };
        drop(state);
        slot.settled.notify_all();
        result
    }

    /// Drop the cached backends named `name`. Returns whether one was cached.
    ///
    /// A construction still in flight is left alone; its callers keep
    /// waiting for it and nobody starts a second one.
    pub fn invalidate(&self, name: &str) -> bool {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .lock()
            .iter()
            .filter(|(identity, _)| identity.name == name)
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        let mut dropped = false;
        for slot in slots {
            dropped |= slot.state.lock().backend.take().is_some();
        }
        if dropped {
            info!(provider = name, "encryption backend invalidated");
        }
        dropped
    }

    /// Number of providers with a constructed backend.
    pub fn constructed(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.state.lock().backend.is_some())
            .count()
    }

    fn slot(&self, identity: ProviderIdentity) -> Arc<Slot> {
        Arc::clone(self.slots.lock().entry(identity).or_default())
    }

    fn construct(&self, provider: &ProviderConfig) -> Result<EncryptionBackend> {
        debug!(provider = %provider.name, kind = %provider.kind, "constructing encryption backend");
        let backend = match &provider.kind {
            ProviderKind::Hsm => self.construct_hardware(provider)?,
            ProviderKind::Password => self.construct_password(provider)?,
            ProviderKind::External | ProviderKind::Unsupported(_) => {
                warn!(provider = %provider.name, kind = %provider.kind, "provider type is not supported");
                return Err(construction_fault(
                    provider,
                    format!("provider type {} is not supported", provider.kind),
                ));
            }
        };
        info!(provider = %provider.name, kind = %provider.kind, "encryption backend ready");
        Ok(backend)
    }

    fn construct_password(&self, provider: &ProviderConfig) -> Result<EncryptionBackend> {
        let settings = provider
            .password
            .as_ref()
            .ok_or_else(|| construction_fault(provider, "password settings missing"))?;
        let key = PasswordKeyProxy::new(settings)
            .derive()
            .map_err(|e| construction_fault(provider, e.to_string()))?;
        Ok(EncryptionBackend::Password(PasswordBackend::new(
            provider.identity(),
            key,
        )))
    }

    fn construct_hardware(&self, provider: &ProviderConfig) -> Result<EncryptionBackend> {
        let settings = provider
            .hsm
            .as_ref()
            .ok_or_else(|| construction_fault(provider, "hsm settings missing"))?;
        let connector = self
            .hsm
            .as_ref()
            .ok_or_else(|| construction_fault(provider, "no hsm connector configured"))?;

        let session = self
            .retry
            .run(&provider.name, |_| connector.connect(settings))
            .map_err(|exhausted| {
                construction_fault(
                    provider,
                    format!(
                        "hsm unreachable after {} attempts: {}",
                        exhausted.attempts, exhausted.last
                    ),
                )
            })?;

        let present = session
            .has_key(&settings.key_label)
            .map_err(|e| construction_fault(provider, e.to_string()))?;
        if !present {
            if !settings.create_key_if_missing {
                return Err(construction_fault(
                    provider,
                    format!("key {} not present in partition", settings.key_label),
                ));
            }
            info!(provider = %provider.name, key_label = %settings.key_label, "creating hsm key");
            session
                .create_key(&settings.key_label)
                .map_err(|e| construction_fault(provider, e.to_string()))?;
        }

        Ok(EncryptionBackend::Hardware(HardwareBackend::new(
            provider.identity(),
            settings.key_label.clone(),
            session,
        )))
    }
}

fn failure_reason(err: &CredError) -> String {
    match err {
        CredError::ProviderConstruction { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

fn construction_fault(provider: &ProviderConfig, reason: impl Into<String>) -> CredError {
    CredError::ProviderConstruction {
        provider: provider.name.clone(),
        reason: reason.into(),
    }
}
