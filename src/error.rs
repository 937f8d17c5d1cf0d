//! Error types for secret-engine.
//!
//! Every variant is a distinct failure mode of the engine. Messages are
//! intentionally minimal: they say *what* failed and, for file errors,
//! *which file*, but never carry key bytes, plaintext or ciphertext.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The single error type for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A key file is missing or unreadable. Fatal during initialization.
    #[error("cannot load key file {path}: {source}")]
    KeyLoad {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A key file does not hold exactly 32 bytes.
    #[error("key file {path} holds {len} bytes, expected 32")]
    KeyFormat { path: PathBuf, len: usize },

    /// Writing a generated or rotated key to disk failed.
    #[error("cannot write key file {path}: {source}")]
    KeyWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A key file has the wrong mode or owner and strict policy forbids
    /// continuing.
    #[error("insecure key file: {0}")]
    Permission(String),

    /// The operation requires a `Ready` engine.
    #[error("encryption engine is not initialized")]
    NotInitialized,

    /// Key management was requested while encryption is disabled by policy.
    #[error("encryption is disabled by configuration")]
    Disabled,

    /// The cipher rejected the key material.
    #[error("invalid key")]
    InvalidKey,

    /// The cipher failed to seal a payload.
    #[error("encryption failed")]
    Encryption,

    /// Tag verification failed: tampered ciphertext or wrong key.
    #[error("authentication failed")]
    Authentication,

    /// The serialized blob or metadata record is malformed.
    #[error("malformed encrypted data: {0}")]
    Format(String),

    /// A chunk set is incomplete, inconsistent, or one of its chunks failed
    /// to decrypt.
    #[error("chunk integrity violated: {0}")]
    ChunkIntegrity(String),

    /// The ciphertext names a key generation the engine does not hold.
    #[error("no key held for version {0}")]
    UnknownKeyVersion(String),

    /// Rotating now would discard a retired key that was never purged.
    #[error("retired key {0} must be purged before the next rotation")]
    RetiredKeyPending(String),

    /// A chunk size of zero was requested.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    /// The system random number generator failed.
    #[error("randomness source failed")]
    Randomness,

    /// The configuration is invalid or could not be read.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Format(format!("metadata: {err}"))
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}
