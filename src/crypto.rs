//! Low-level cryptographic operations.
//!
//! This module and `keys` are the only places that import `ring`'s AEAD and
//! KDF primitives. Backends and the soft HSM encrypt exclusively through the
//! functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)
//!
//! Unlike a sealed blob, the nonce is returned next to the ciphertext: a
//! secret version stores both columns and the invariant "both or neither"
//! is checked by the caller.

use once_cell::sync::Lazy;
use ring::aead::{self, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::ProviderFault;

const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of a data-encryption key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

static RNG: Lazy<SystemRandom> = Lazy::new(SystemRandom::new);

/// Generate a fresh random nonce. There is no counter-based generation.
pub(crate) fn generate_nonce() -> Result<[u8; NONCE_LEN], ProviderFault> {
    let mut buf = [0u8; NONCE_LEN];
    RNG.fill(&mut buf).map_err(|_| ProviderFault::RandomnessFailure)?;
    Ok(buf)
}

/// Generate random key material. Used by the soft HSM when it creates a key.
pub(crate) fn generate_random_key() -> Result<[u8; KEY_LEN], ProviderFault> {
    let mut key = [0u8; KEY_LEN];
    RNG.fill(&mut key).map_err(|_| ProviderFault::RandomnessFailure)?;
    Ok(key)
}

fn sealing_key(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey, ProviderFault> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| ProviderFault::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `key_bytes` with the given nonce.
///
/// Returns ciphertext with the GCM tag appended.
pub(crate) fn encrypt_with_nonce(
    key_bytes: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, ProviderFault> {
    let key = sealing_key(key_bytes)?;
    let mut output = Vec::with_capacity(plaintext.len() + ALGORITHM.tag_len());
    output.extend_from_slice(plaintext);

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(*nonce),
        aead::Aad::empty(),
        &mut output,
    )
    .map_err(|_| ProviderFault::EncryptionFailure)?;

    Ok(output)
}

/// Encrypt with a freshly generated nonce. Returns `(ciphertext, nonce)`.
pub(crate) fn encrypt(
    key_bytes: &[u8; KEY_LEN],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_LEN]), ProviderFault> {
    let nonce = generate_nonce()?;
    let ciphertext = encrypt_with_nonce(key_bytes, &nonce, plaintext)?;
    Ok((ciphertext, nonce))
}

/// Decrypt a ciphertext produced by `encrypt`.
///
/// A wrong key, a wrong nonce or tampered bytes all fail the GCM tag check;
/// the caller receives no partial plaintext.
pub(crate) fn decrypt(
    key_bytes: &[u8; KEY_LEN],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, ProviderFault> {
    let nonce: [u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| ProviderFault::DecryptionFailure)?;
    let key = sealing_key(key_bytes)?;

    let mut payload = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce),
            aead::Aad::empty(),
            &mut payload,
        )
        .map_err(|_| ProviderFault::DecryptionFailure)?;

    Ok(plaintext.to_vec())
}
