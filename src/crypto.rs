//! Low-level cryptographic operations.
//!
//! This module and `keys` are the only places in the crate that import
//! `ring` directly. Everything else seals and opens data through `AeadKey`.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM by default, ChaCha20-Poly1305 as an alternative
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)

use std::fmt;

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of a key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of the authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// AEAD algorithms the engine can seal with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    #[serde(rename = "CHACHA20-POLY1305")]
    ChaCha20Poly1305,
}

impl Algorithm {
    /// Identifier byte written into the blob header.
    pub fn id(self) -> u8 {
        match self {
            Self::Aes256Gcm => 1,
            Self::ChaCha20Poly1305 => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Aes256Gcm),
            2 => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "CHACHA20-POLY1305",
        }
    }

    fn ring(self) -> &'static aead::Algorithm {
        match self {
            Self::Aes256Gcm => &AES_256_GCM,
            Self::ChaCha20Poly1305 => &CHACHA20_POLY1305,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A cipher context bound to one key for its whole lifetime.
///
/// The raw key bytes are only read while constructing the context; `ring`
/// keeps its own expanded key schedule afterwards.
pub(crate) struct AeadKey {
    key: LessSafeKey,
    algorithm: Algorithm,
    rng: SystemRandom,
}

impl AeadKey {
    pub(crate) fn new(algorithm: Algorithm, key_bytes: &[u8; KEY_LEN]) -> Result<Self> {
        let unbound = UnboundKey::new(algorithm.ring(), key_bytes)
            .map_err(|_| EngineError::InvalidKey)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            algorithm,
            rng: SystemRandom::new(),
        })
    }

    pub(crate) fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Draw a fresh random nonce. There is no nonce caching or counter; a
    /// 96-bit random nonce per call keeps collisions negligible for the
    /// volumes a single key sees between rotations.
    pub(crate) fn generate_nonce(&self) -> Result<[u8; NONCE_LEN]> {
        let mut buf = [0u8; NONCE_LEN];
        self.rng.fill(&mut buf).map_err(|_| EngineError::Randomness)?;
        Ok(buf)
    }

    /// Encrypt `plaintext` under `nonce`, authenticating `aad` alongside it.
    ///
    /// Returns ciphertext with the tag appended.
    pub(crate) fn seal(&self, nonce: [u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut in_out = Vec::with_capacity(plaintext.len() + TAG_LEN);
        in_out.extend_from_slice(plaintext);
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
            .map_err(|_| EngineError::Encryption)?;
        Ok(in_out)
    }

    /// Verify and decrypt. The caller receives no partial plaintext when the
    /// tag does not match.
    pub(crate) fn open(&self, nonce: [u8; NONCE_LEN], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(EngineError::Format("ciphertext shorter than tag".into()));
        }
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
            .map_err(|_| EngineError::Authentication)?;
        Ok(plaintext.to_vec())
    }
}

/// Fill `key` with cryptographically secure random bytes.
///
/// The only function in the crate that produces raw key material from
/// scratch. It writes into the caller's buffer so no copy of the key is
/// left behind on the stack.
pub(crate) fn fill_random_key(key: &mut [u8; KEY_LEN]) -> Result<()> {
    SystemRandom::new()
        .fill(key)
        .map_err(|_| EngineError::Randomness)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip_both_algorithms() {
        for algorithm in [Algorithm::Aes256Gcm, Algorithm::ChaCha20Poly1305] {
            let key = AeadKey::new(algorithm, &[7u8; KEY_LEN]).unwrap();
            let nonce = key.generate_nonce().unwrap();
            let sealed = key.seal(nonce, b"header", b"payload").unwrap();
            assert_eq!(sealed.len(), b"payload".len() + TAG_LEN);
            assert_eq!(key.open(nonce, b"header", &sealed).unwrap(), b"payload");
        }
    }

    #[test]
    fn open_rejects_wrong_aad() {
        let key = AeadKey::new(Algorithm::Aes256Gcm, &[7u8; KEY_LEN]).unwrap();
        let nonce = key.generate_nonce().unwrap();
        let sealed = key.seal(nonce, b"header", b"payload").unwrap();
        assert!(matches!(
            key.open(nonce, b"other", &sealed),
            Err(EngineError::Authentication)
        ));
    }

    #[test]
    fn algorithm_ids_roundtrip() {
        for algorithm in [Algorithm::Aes256Gcm, Algorithm::ChaCha20Poly1305] {
            assert_eq!(Algorithm::from_id(algorithm.id()), Some(algorithm));
        }
        assert_eq!(Algorithm::from_id(0), None);
    }

    #[test]
    fn random_keys_differ() {
        let mut a = [0u8; KEY_LEN];
        let mut b = [0u8; KEY_LEN];
        fill_random_key(&mut a).unwrap();
        fill_random_key(&mut b).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, [0u8; KEY_LEN]);
    }
}
