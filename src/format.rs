//! Encrypted unit, blob framing and metadata records.
//!
//! A unit is persisted as two artifacts that are stored together:
//!
//! - an opaque binary **blob** carrying framing, nonce and ciphertext;
//! - a JSON **metadata** record (algorithm, key version, chunk position,
//!   timestamp) that tooling can read without touching ciphertext.
//!
//! # Blob layout
//! ```text
//! [ "SENC" (4) ][ format version (1) ][ algorithm (1) ][ flags (1) ]
//! [ chunk index u32 BE (4) ][ chunk count u32 BE (4) ]
//! [ created_at millis i64 BE (8) ][ key version len (1) ][ key version ]
//! [ nonce (12) ][ ciphertext + tag ]
//! ```
//!
//! Everything before the nonce is the header. The header is authenticated
//! as associated data, so editing any header field after sealing fails tag
//! verification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{Algorithm, NONCE_LEN, TAG_LEN};
use crate::error::{EngineError, Result};
use crate::keys::KeyVersion;

pub const MAGIC: [u8; 4] = *b"SENC";
pub const FORMAT_VERSION: u8 = 1;

const FLAG_CHUNKED: u8 = 0b0000_0001;
const FIXED_HEADER_LEN: usize = 24;
const MAX_KEY_VERSION_LEN: usize = u8::MAX as usize;

/// Position of a unit inside a chunk set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPosition {
    pub index: u32,
    pub count: u32,
}

/// The result of one encryption call. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedUnit {
    pub algorithm: Algorithm,
    pub key_version: KeyVersion,
    pub chunk: Option<ChunkPosition>,
    pub created_at: DateTime<Utc>,
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,
}

/// Header fields shared by sealing (as AAD) and serialization.
pub(crate) struct Header<'a> {
    pub algorithm: Algorithm,
    pub key_version: &'a KeyVersion,
    pub chunk: Option<ChunkPosition>,
    pub created_at: DateTime<Utc>,
}

impl Header<'_> {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let version = self.key_version.as_str().as_bytes();
        if version.is_empty() || version.len() > MAX_KEY_VERSION_LEN {
            return Err(EngineError::Format(format!(
                "key version length {} out of range",
                version.len()
            )));
        }

        let (flags, index, count) = match self.chunk {
            Some(pos) => (FLAG_CHUNKED, pos.index, pos.count),
            None => (0, 0, 0),
        };

        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + version.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(FORMAT_VERSION);
        buf.push(self.algorithm.id());
        buf.push(flags);
        buf.extend_from_slice(&index.to_be_bytes());
        buf.extend_from_slice(&count.to_be_bytes());
        buf.extend_from_slice(&self.created_at.timestamp_millis().to_be_bytes());
        buf.push(version.len() as u8);
        buf.extend_from_slice(version);
        Ok(buf)
    }
}

/// Truncate a timestamp to the millisecond precision the blob carries.
pub(crate) fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

impl EncryptedUnit {
    /// The header bytes authenticated alongside this unit's ciphertext.
    pub fn header_bytes(&self) -> Result<Vec<u8>> {
        Header {
            algorithm: self.algorithm,
            key_version: &self.key_version,
            chunk: self.chunk,
            created_at: self.created_at,
        }
        .to_bytes()
    }

    pub fn metadata(&self) -> EncryptionMetadata {
        EncryptionMetadata {
            format_version: FORMAT_VERSION,
            algorithm: self.algorithm,
            key_version: self.key_version.clone(),
            chunk_index: self.chunk.map(|c| c.index),
            chunk_count: self.chunk.map(|c| c.count),
            created_at: self.created_at,
        }
    }
}

/// Canonical byte encoding of a unit. Store it verbatim.
pub fn serialize_encrypted_data(unit: &EncryptedUnit) -> Result<Vec<u8>> {
    let header = unit.header_bytes()?;
    let mut out = Vec::with_capacity(header.len() + NONCE_LEN + unit.ciphertext.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&unit.nonce);
    out.extend_from_slice(&unit.ciphertext);
    Ok(out)
}

/// Parse a blob produced by `serialize_encrypted_data`.
///
/// Only framing is checked here; integrity is asserted when the unit is
/// decrypted.
pub fn deserialize_encrypted_data(blob: &[u8]) -> Result<EncryptedUnit> {
    if blob.len() < FIXED_HEADER_LEN {
        return Err(EngineError::Format("blob shorter than header".into()));
    }
    if blob[0..4] != MAGIC {
        return Err(EngineError::Format("bad magic".into()));
    }
    if blob[4] != FORMAT_VERSION {
        return Err(EngineError::Format(format!("unsupported format version {}", blob[4])));
    }
    let algorithm = Algorithm::from_id(blob[5])
        .ok_or_else(|| EngineError::Format(format!("unknown algorithm id {}", blob[5])))?;

    let flags = blob[6];
    let index = u32::from_be_bytes(read_array(&blob[7..11]));
    let count = u32::from_be_bytes(read_array(&blob[11..15]));
    let chunk = match flags {
        0 if index != 0 || count != 0 => {
            return Err(EngineError::Format("chunk fields set on unchunked unit".into()))
        }
        0 => None,
        FLAG_CHUNKED => Some(ChunkPosition { index, count }),
        other => return Err(EngineError::Format(format!("unknown flags {other:#04x}"))),
    };
    let millis = i64::from_be_bytes(read_array(&blob[15..23]));
    let created_at = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| EngineError::Format("timestamp out of range".into()))?;

    let version_len = blob[23] as usize;
    let version_end = FIXED_HEADER_LEN + version_len;
    let nonce_end = version_end + NONCE_LEN;
    if version_len == 0 || blob.len() < nonce_end + TAG_LEN {
        return Err(EngineError::Format("blob truncated".into()));
    }
    let key_version = std::str::from_utf8(&blob[FIXED_HEADER_LEN..version_end])
        .map_err(|_| EngineError::Format("key version is not utf-8".into()))?;

    Ok(EncryptedUnit {
        algorithm,
        key_version: KeyVersion::new(key_version),
        chunk,
        created_at,
        nonce: read_array(&blob[version_end..nonce_end]),
        ciphertext: blob[nonce_end..].to_vec(),
    })
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Human-inspectable description of an encrypted unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    pub format_version: u8,
    pub algorithm: Algorithm,
    pub key_version: KeyVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl EncryptionMetadata {
    /// Check that this record describes `unit`.
    pub fn verify_against(&self, unit: &EncryptedUnit) -> Result<()> {
        let expected = unit.metadata();
        if *self != expected {
            return Err(EngineError::Format("metadata does not match blob".into()));
        }
        Ok(())
    }
}

pub fn serialize_metadata(metadata: &EncryptionMetadata) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(metadata)?)
}

pub fn deserialize_metadata(bytes: &[u8]) -> Result<EncryptionMetadata> {
    Ok(serde_json::from_slice(bytes)?)
}
