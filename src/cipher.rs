//! The encryption primitive service.
//!
//! A `CipherService` is bound to one key for its whole life. Rotation builds
//! a new service rather than mutating this one, so the cipher path needs no
//! locking of its own.

use tracing::debug;

use crate::crypto::{AeadKey, Algorithm};
use crate::error::{EngineError, Result};
use crate::format::{self, ChunkPosition, EncryptedUnit, Header};
use crate::keys::{KeyMaterial, KeyVersion};

/// Stateless authenticated encryption under one bound key.
pub struct CipherService {
    version: KeyVersion,
    algorithm: Algorithm,
    aes: AeadKey,
    chacha: AeadKey,
}

impl CipherService {
    /// Bind a service to `key`. New units are sealed with `algorithm`; units
    /// sealed with either supported algorithm can be opened.
    pub fn new(key: &KeyMaterial, algorithm: Algorithm) -> Result<Self> {
        Ok(Self {
            version: key.version(),
            algorithm,
            aes: AeadKey::new(Algorithm::Aes256Gcm, key.as_bytes())?,
            chacha: AeadKey::new(Algorithm::ChaCha20Poly1305, key.as_bytes())?,
        })
    }

    /// Version of the bound key, stamped onto every unit this service seals.
    pub fn key_version(&self) -> &KeyVersion {
        &self.version
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn key_for(&self, algorithm: Algorithm) -> &AeadKey {
        match algorithm {
            Algorithm::Aes256Gcm => &self.aes,
            Algorithm::ChaCha20Poly1305 => &self.chacha,
        }
    }

    /// Encrypt one payload under a fresh nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedUnit> {
        self.seal_unit(plaintext, None)
    }

    fn seal_unit(&self, plaintext: &[u8], chunk: Option<ChunkPosition>) -> Result<EncryptedUnit> {
        let key = self.key_for(self.algorithm);
        let created_at = format::now_millis();
        let aad = Header {
            algorithm: key.algorithm(),
            key_version: &self.version,
            chunk,
            created_at,
        }
        .to_bytes()?;

        let nonce = key.generate_nonce()?;
        let ciphertext = key.seal(nonce, &aad, plaintext)?;

        Ok(EncryptedUnit {
            algorithm: key.algorithm(),
            key_version: self.version.clone(),
            chunk,
            created_at,
            nonce,
            ciphertext,
        })
    }

    /// Verify and decrypt one unit.
    ///
    /// Fails with `UnknownKeyVersion` when the unit was sealed under another
    /// key, and with `Authentication` when the tag does not verify.
    pub fn decrypt(&self, unit: &EncryptedUnit) -> Result<Vec<u8>> {
        if unit.key_version != self.version {
            return Err(EngineError::UnknownKeyVersion(unit.key_version.to_string()));
        }
        let aad = unit.header_bytes()?;
        self.key_for(unit.algorithm).open(unit.nonce, &aad, &unit.ciphertext)
    }

    /// Split `plaintext` into chunks of at most `chunk_size` bytes and seal
    /// each one independently, tagged with its index and the total count.
    ///
    /// Boundaries depend only on `chunk_size`. Empty input yields no chunks.
    pub fn encrypt_chunked(&self, plaintext: &[u8], chunk_size: usize) -> Result<Vec<EncryptedUnit>> {
        if chunk_size == 0 {
            return Err(EngineError::InvalidChunkSize);
        }
        let count = u32::try_from(plaintext.len().div_ceil(chunk_size))
            .map_err(|_| EngineError::ChunkIntegrity("too many chunks".into()))?;

        let units = plaintext
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let position = ChunkPosition {
                    index: index as u32,
                    count,
                };
                self.seal_unit(chunk, Some(position))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(chunks = count, bytes = plaintext.len(), "encrypted chunk set");
        Ok(units)
    }

    /// Decrypt a chunk set and reassemble the original payload.
    pub fn decrypt_chunked(&self, units: &[EncryptedUnit]) -> Result<Vec<u8>> {
        reassemble(units, |unit| self.decrypt(unit))
    }
}

/// Put a chunk set in index order, rejecting gaps, duplicates, unchunked
/// units and disagreeing counts.
pub(crate) fn order_chunks(units: &[EncryptedUnit]) -> Result<Vec<&EncryptedUnit>> {
    let mut ordered = Vec::with_capacity(units.len());
    let mut expected_count = None;

    for unit in units {
        let position = unit
            .chunk
            .ok_or_else(|| EngineError::ChunkIntegrity("unit carries no chunk position".into()))?;
        match expected_count {
            None => expected_count = Some(position.count),
            Some(count) if count != position.count => {
                return Err(EngineError::ChunkIntegrity(format!(
                    "chunk {} claims {} chunks, set claims {count}",
                    position.index, position.count
                )))
            }
            Some(_) => {}
        }
        ordered.push((position.index, unit));
    }

    let count = expected_count.unwrap_or(0) as usize;
    if ordered.len() != count {
        return Err(EngineError::ChunkIntegrity(format!(
            "expected {count} chunks, got {}",
            ordered.len()
        )));
    }

    ordered.sort_by_key(|(index, _)| *index);
    for (position, (index, _)) in ordered.iter().enumerate() {
        if *index as usize != position {
            return Err(EngineError::ChunkIntegrity(format!(
                "chunk {position} missing or duplicated"
            )));
        }
    }
    Ok(ordered.into_iter().map(|(_, unit)| unit).collect())
}

/// Decrypt every chunk with `open` and concatenate in index order.
pub(crate) fn reassemble<F>(units: &[EncryptedUnit], mut open: F) -> Result<Vec<u8>>
where
    F: FnMut(&EncryptedUnit) -> Result<Vec<u8>>,
{
    let ordered = order_chunks(units)?;
    let mut out = Vec::new();
    for (index, unit) in ordered.into_iter().enumerate() {
        let plaintext = open(unit).map_err(|err| match err {
            EngineError::Authentication => {
                EngineError::ChunkIntegrity(format!("chunk {index} failed authentication"))
            }
            other => other,
        })?;
        out.extend_from_slice(&plaintext);
    }
    Ok(out)
}
