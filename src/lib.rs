//! # credcore
//!
//! Trust core of a secret-storage service.
//!
//! Secret values are encrypted transparently on write and decrypted on read
//! through a registry of key providers. Every read and write is gated by a
//! permission check, and every request leaves an audit trail that is
//! committed together with the request's side effects.
//!
//! ## Public API
//!
//! - [`KeyProviderRegistry`] builds one [`EncryptionBackend`] per configured
//!   provider, lazily and at most once.
//! - [`Encryptor`] assigns and reveals version payloads.
//! - [`PermissionChecker`] and [`AclService`] answer and mutate access
//!   control.
//! - [`SecretService`] runs the full guarded pipeline over the stores in
//!   [`store`].
//!
//! Key derivation and AEAD primitives stay `pub(crate)`.

pub mod acl;
pub mod audit;
pub mod backend;
pub mod config;
pub(crate) mod crypto;
pub mod encryptor;
pub mod error;
pub mod hsm;
pub mod identity;
pub(crate) mod keys;
pub mod permission;
pub mod registry;
pub mod retry;
pub mod secret;
pub mod service;
pub mod store;

pub use acl::AclService;
pub use audit::{AuditOperation, AuditRecord, AuditSink, AuditTrail, FileAuditSink};
pub use backend::{Encrypted, EncryptionBackend};
pub use config::{
    CoreConfig, EncryptionConfig, HsmSettings, PasswordSettings, ProviderConfig, ProviderKind,
};
pub use encryptor::Encryptor;
pub use error::{CredError, ErrorKind, ProviderFault, Result};
pub use hsm::{HsmConnector, HsmSession, SoftHsm};
pub use identity::{AuthMethod, RequestDescriptor, TokenClaims, UserContext};
pub use permission::{AccessControlEntry, PermissionChecker, PermissionEntry, PermissionOperation};
pub use registry::KeyProviderRegistry;
pub use retry::RetryPolicy;
pub use secret::{CredentialType, SecretPath, SecretVersion};
pub use service::{RevealedSecret, SecretService, Stores};
pub use store::{Committer, MemoryStore, UnitOfWork};
