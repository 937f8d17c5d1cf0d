//! # secret-engine
//!
//! Authenticated encryption of secrets at rest behind a rotatable,
//! file-backed key.
//!
//! The crate is built from three layers:
//!
//! - [`keys::KeyManager`] loads, validates, rotates and wipes the key files;
//! - [`cipher::CipherService`] seals and opens payloads (single or chunked)
//!   under one bound key;
//! - [`EncryptionEngine`] ties them together behind a reader/writer lock and
//!   applies the enabled/disabled policy.
//!
//! ```no_run
//! use secret_engine::{EncryptionEngine, EngineConfig};
//!
//! let engine = EncryptionEngine::new(EngineConfig::new().with_key_dir("/var/lib/app/keys"));
//! engine.initialize()?;
//! let (blob, metadata) = engine.encrypt_secret(b"hello world")?;
//! assert_eq!(engine.decrypt_secret(&blob)?, b"hello world");
//! # let _ = metadata;
//! # Ok::<(), secret_engine::EngineError>(())
//! ```
//!
//! Callers that persist encrypted data store the blob and the metadata
//! record together. In disabled mode the "blob" is the plaintext itself.

pub mod audit;
pub mod cipher;
pub mod config;
pub(crate) mod crypto;
pub mod engine;
pub mod error;
pub mod format;
pub mod keys;
pub mod permissions;
pub mod tokens;

pub use crypto::{Algorithm, KEY_LEN, NONCE_LEN};
pub use config::EngineConfig;
pub use engine::{EncryptionEngine, LifecycleState};
pub use error::{EngineError, Result};
pub use format::{
    deserialize_encrypted_data, deserialize_metadata, serialize_encrypted_data, serialize_metadata,
    ChunkPosition, EncryptedUnit, EncryptionMetadata,
};
pub use keys::{KeyMaterial, KeyVersion, Rotation};
pub use permissions::{PermissionWarning, ValidationReport};

/// Generate fresh key material.
///
/// This is the entry point for producing a key outside of the key manager,
/// for example to provision a key file or to drive `rotate_keys_to`.
pub fn generate_key() -> Result<KeyMaterial> {
    KeyMaterial::generate()
}
