//! The orchestrating engine.
//!
//! `EncryptionEngine` owns the key manager and the cipher services bound to
//! the active and retired keys, all behind one reader/writer lock:
//!
//! - encrypt/decrypt and read-only queries take the shared lock and run in
//!   parallel;
//! - initialize, rotate, purge and shutdown take the exclusive lock, so no
//!   call ever observes a half-initialized or half-rotated key.
//!
//! ```text
//! Uninitialized -> Initializing -> Ready -> (RotatingKeys -> Ready) -> ShuttingDown -> Stopped
//! ```
//!
//! When encryption is disabled by configuration, the secret entry points
//! are identity functions in every state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditLog, AuditRecord, AuditSink, KeyEvent};
use crate::cipher::{self, CipherService};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::format::{self, EncryptedUnit};
use crate::keys::{KeyManager, KeyMaterial, KeyVersion, Rotation};
use crate::permissions::{PermissionCheck, ValidationReport};

const KIB: usize = 1024;

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    RotatingKeys,
    ShuttingDown,
    Stopped,
}

struct Inner {
    state: LifecycleState,
    keys: KeyManager,
    active: Option<CipherService>,
    retired: HashMap<KeyVersion, CipherService>,
}

impl Inner {
    fn ready(&self) -> Result<&CipherService> {
        match (self.state, &self.active) {
            (LifecycleState::Ready, Some(active)) => Ok(active),
            _ => Err(EngineError::NotInitialized),
        }
    }

    /// Decrypt with whichever held key sealed `unit`.
    fn open(&self, unit: &EncryptedUnit) -> Result<Vec<u8>> {
        let active = self.ready()?;
        if unit.key_version == *active.key_version() {
            return active.decrypt(unit);
        }
        match self.retired.get(&unit.key_version) {
            Some(retired) => retired.decrypt(unit),
            None => Err(EngineError::UnknownKeyVersion(unit.key_version.to_string())),
        }
    }

    fn forget_keys(&mut self) {
        self.active = None;
        self.retired.clear();
        self.keys.wipe();
    }
}

/// Thread-safe encrypt/decrypt/rotate façade. Share it through an `Arc`.
pub struct EncryptionEngine {
    config: EngineConfig,
    inner: RwLock<Inner>,
    audit: Mutex<AuditLog>,
}

impl EncryptionEngine {
    pub fn new(config: EngineConfig) -> Self {
        let keys = KeyManager::new(&config);
        Self {
            config,
            inner: RwLock::new(Inner {
                state: LifecycleState::Uninitialized,
                keys,
                active: None,
                retired: HashMap::new(),
            }),
            audit: Mutex::new(AuditLog::new()),
        }
    }

    /// Replace the file-permission collaborator used during validation.
    pub fn with_permission_check(mut self, checker: Arc<dyn PermissionCheck>) -> Self {
        self.inner.get_mut().keys = KeyManager::new(&self.config).with_permission_check(checker);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Static policy: whether encryption is turned on at all.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Runtime readiness.
    pub fn is_initialized(&self) -> bool {
        self.inner.read().state == LifecycleState::Ready
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.read().state
    }

    /// Load keys and bind the cipher. On failure the engine stays
    /// `Uninitialized` with no key material held.
    #[instrument(skip_all)]
    pub fn initialize(&self) -> Result<ValidationReport> {
        let mut inner = self.inner.write();
        if inner.state == LifecycleState::Ready {
            debug!("engine already initialized");
            return Ok(ValidationReport::default());
        }
        self.config.validate()?;

        if !self.config.enabled {
            inner.state = LifecycleState::Ready;
            info!("encryption disabled by configuration; secrets pass through unchanged");
            return Ok(ValidationReport::default());
        }

        inner.state = LifecycleState::Initializing;
        match self.load(&mut inner) {
            Ok(report) => {
                inner.state = LifecycleState::Ready;
                let version = inner.active.as_ref().map(|a| a.key_version().clone());
                info!(version = ?version, retired = inner.retired.len(), "encryption engine ready");

                let mut audit = self.audit.lock();
                if report.generated.is_some() {
                    audit.append(AuditRecord::new(KeyEvent::Generated, version.clone()));
                }
                audit.append(AuditRecord::new(KeyEvent::Initialized, version));
                Ok(report)
            }
            Err(err) => {
                inner.forget_keys();
                inner.state = LifecycleState::Uninitialized;
                warn!(error = %err, "encryption engine failed to initialize");
                Err(err)
            }
        }
    }

    fn load(&self, inner: &mut Inner) -> Result<ValidationReport> {
        let report = inner.keys.initialize()?;
        let active = CipherService::new(inner.keys.kek()?, self.config.algorithm)?;
        let retired = self.bind_retired(&inner.keys)?;
        inner.active = Some(active);
        inner.retired = retired;
        Ok(report)
    }

    fn bind_retired(&self, keys: &KeyManager) -> Result<HashMap<KeyVersion, CipherService>> {
        keys.retired()
            .iter()
            .map(|k| {
                let service = CipherService::new(k.material(), self.config.algorithm)?;
                Ok((k.version().clone(), service))
            })
            .collect()
    }

    /// Version of the active key.
    pub fn key_version(&self) -> Result<KeyVersion> {
        if !self.config.enabled {
            return Err(EngineError::Disabled);
        }
        Ok(self.inner.read().ready()?.key_version().clone())
    }

    /// Re-check size, mode and ownership of the key files while running.
    ///
    /// Findings are returned, not escalated: strict policy only gates
    /// `initialize`. Mode issues are repaired when `fix_permissions` is set.
    #[instrument(skip_all)]
    pub fn validate_key_files(&self) -> Result<ValidationReport> {
        if !self.config.enabled {
            return Err(EngineError::Disabled);
        }
        let inner = self.inner.read();
        inner.ready()?;
        inner.keys.validate_key_files()
    }

    /// Versions of superseded keys still held for decryption.
    pub fn retired_versions(&self) -> Vec<KeyVersion> {
        let mut versions: Vec<_> = self.inner.read().retired.keys().cloned().collect();
        versions.sort();
        versions
    }

    /// Encrypt one secret, returning `(blob, metadata)`.
    ///
    /// Disabled mode returns the plaintext unchanged with empty metadata.
    #[instrument(level = "debug", skip_all, fields(bytes = plaintext.len()))]
    pub fn encrypt_secret(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        if !self.config.enabled {
            return Ok((plaintext.to_vec(), Vec::new()));
        }
        let unit = self.inner.read().ready()?.encrypt(plaintext)?;
        Ok((
            format::serialize_encrypted_data(&unit)?,
            format::serialize_metadata(&unit.metadata())?,
        ))
    }

    /// Decrypt a blob produced by `encrypt_secret`.
    ///
    /// Disabled mode returns the input unchanged.
    #[instrument(level = "debug", skip_all, fields(bytes = blob.len()))]
    pub fn decrypt_secret(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if !self.config.enabled {
            return Ok(blob.to_vec());
        }
        let inner = self.inner.read();
        inner.ready()?;
        let unit = format::deserialize_encrypted_data(blob)?;
        inner.open(&unit)
    }

    /// Like `decrypt_secret`, but also checks that the stored metadata
    /// record describes the blob.
    pub fn decrypt_secret_with_metadata(&self, blob: &[u8], metadata: &[u8]) -> Result<Vec<u8>> {
        if !self.config.enabled {
            return Ok(blob.to_vec());
        }
        let inner = self.inner.read();
        inner.ready()?;
        let unit = format::deserialize_encrypted_data(blob)?;
        format::deserialize_metadata(metadata)?.verify_against(&unit)?;
        inner.open(&unit)
    }

    /// Encrypt a large secret as independently sealed chunks of
    /// `chunk_size_kb` KiB (`0` selects the configured default).
    ///
    /// Returns one blob and one metadata record per chunk, in order.
    #[instrument(level = "debug", skip_all, fields(bytes = plaintext.len(), chunk_size_kb = chunk_size_kb))]
    pub fn encrypt_large_secret(
        &self,
        plaintext: &[u8],
        chunk_size_kb: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let kb = if chunk_size_kb == 0 {
            self.config.chunk_size_kb
        } else {
            chunk_size_kb
        };
        let chunk_size = kb.checked_mul(KIB).ok_or(EngineError::InvalidChunkSize)?;
        if chunk_size == 0 {
            return Err(EngineError::InvalidChunkSize);
        }

        if !self.config.enabled {
            let chunks: Vec<Vec<u8>> = plaintext.chunks(chunk_size).map(<[u8]>::to_vec).collect();
            let metadata = vec![Vec::new(); chunks.len()];
            return Ok((chunks, metadata));
        }

        let units = self.inner.read().ready()?.encrypt_chunked(plaintext, chunk_size)?;
        let mut blobs = Vec::with_capacity(units.len());
        let mut metadata = Vec::with_capacity(units.len());
        for unit in &units {
            blobs.push(format::serialize_encrypted_data(unit)?);
            metadata.push(format::serialize_metadata(&unit.metadata())?);
        }
        Ok((blobs, metadata))
    }

    /// Reassemble a large secret from its chunk blobs, in any order.
    ///
    /// Disabled mode concatenates the inputs as given.
    #[instrument(level = "debug", skip_all, fields(chunks = blobs.len()))]
    pub fn decrypt_large_secret<B: AsRef<[u8]>>(&self, blobs: &[B]) -> Result<Vec<u8>> {
        if !self.config.enabled {
            return Ok(blobs.iter().flat_map(|b| b.as_ref().iter().copied()).collect());
        }
        let inner = self.inner.read();
        inner.ready()?;
        let units = blobs
            .iter()
            .map(|b| format::deserialize_encrypted_data(b.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        cipher::reassemble(&units, |unit| inner.open(unit))
    }

    /// Replace the active key with a freshly generated one.
    ///
    /// Previously stored ciphertext is not touched. Callers who need it under
    /// the new key rotate first and then run a re-encryption sweep; that only
    /// works while `retain_retired_keys` is on.
    ///
    /// With retention on, one retired key is held at a time: rotating again
    /// before `purge_retired_keys` fails with `RetiredKeyPending`.
    #[instrument(skip_all)]
    pub fn rotate_keys(&self) -> Result<Rotation> {
        self.rotate_keys_to(KeyMaterial::generate()?)
    }

    /// Replace the active key with caller-supplied material.
    #[instrument(skip_all)]
    pub fn rotate_keys_to(&self, material: KeyMaterial) -> Result<Rotation> {
        if !self.config.enabled {
            return Err(EngineError::Disabled);
        }
        let mut inner = self.inner.write();
        inner.ready()?;

        // Bind the new cipher before touching key state so a failure here
        // leaves the engine on the old key.
        let next = CipherService::new(&material, self.config.algorithm)?;

        inner.state = LifecycleState::RotatingKeys;
        let result = inner.keys.rotate_to(material).and_then(|rotation| {
            let retired = self.bind_retired(&inner.keys)?;
            Ok((rotation, retired))
        });
        inner.state = LifecycleState::Ready;

        let (rotation, retired) = result?;
        inner.active = Some(next);
        inner.retired = retired;
        drop(inner);

        info!(%rotation, retained = rotation.retained, "encryption key rotated");
        self.audit.lock().append(
            AuditRecord::new(KeyEvent::Rotated, Some(rotation.current.clone()))
                .with_previous(rotation.previous.clone()),
        );
        Ok(rotation)
    }

    /// Wipe every retired key and remove the previous key file. Ciphertext
    /// sealed under those keys becomes unreadable.
    #[instrument(skip_all)]
    pub fn purge_retired_keys(&self) -> Result<usize> {
        if !self.config.enabled {
            return Err(EngineError::Disabled);
        }
        let mut inner = self.inner.write();
        let version = inner.ready()?.key_version().clone();
        let purged = inner.keys.purge_retired()?;
        inner.retired.clear();
        drop(inner);

        self.audit
            .lock()
            .append(AuditRecord::new(KeyEvent::RetiredPurged, Some(version)));
        Ok(purged)
    }

    /// Wipe all key material and stop. Safe to call more than once.
    #[instrument(skip_all)]
    pub fn shutdown(&self) {
        let mut inner = self.inner.write();
        if inner.state == LifecycleState::Stopped {
            debug!("engine already stopped");
            return;
        }
        let held_keys = inner.active.is_some();
        inner.state = LifecycleState::ShuttingDown;
        inner.forget_keys();
        inner.state = LifecycleState::Stopped;
        drop(inner);

        info!("encryption engine stopped");
        if held_keys {
            self.audit.lock().append(AuditRecord::new(KeyEvent::Wiped, None));
        }
    }

    /// Forward every future audit record to `sink`.
    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.audit.lock().add_forward_sink(sink);
    }

    /// Snapshot of the lifecycle audit trail.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_key(dir: &std::path::Path, key: [u8; 32]) -> EncryptionEngine {
        std::fs::write(dir.join("kek.key"), key).unwrap();
        let config = EngineConfig::new()
            .with_key_dir(dir)
            .with_strict_permissions(false);
        EncryptionEngine::new(config)
    }

    #[test]
    fn calls_before_initialize_fail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_key(dir.path(), [1u8; 32]);
        assert_eq!(engine.state(), LifecycleState::Uninitialized);
        assert!(matches!(engine.encrypt_secret(b"x"), Err(EngineError::NotInitialized)));
        assert!(matches!(engine.key_version(), Err(EngineError::NotInitialized)));
    }

    #[test]
    fn lifecycle_reaches_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_key(dir.path(), [1u8; 32]);
        engine.initialize().unwrap();
        assert_eq!(engine.state(), LifecycleState::Ready);
        assert!(engine.is_initialized());

        engine.shutdown();
        assert_eq!(engine.state(), LifecycleState::Stopped);
        assert!(matches!(engine.decrypt_secret(b"x"), Err(EngineError::NotInitialized)));

        engine.shutdown();
        assert_eq!(engine.state(), LifecycleState::Stopped);
    }

    #[test]
    fn initialize_twice_keeps_key() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_key(dir.path(), [1u8; 32]);
        engine.initialize().unwrap();
        let version = engine.key_version().unwrap();
        engine.initialize().unwrap();
        assert_eq!(engine.key_version().unwrap(), version);
    }

    #[test]
    fn restart_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_key(dir.path(), [1u8; 32]);
        engine.initialize().unwrap();
        let (blob, _) = engine.encrypt_secret(b"persisted").unwrap();
        engine.shutdown();

        engine.initialize().unwrap();
        assert_eq!(engine.decrypt_secret(&blob).unwrap(), b"persisted");
    }

    #[test]
    fn audit_trail_follows_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_key(dir.path(), [1u8; 32]);
        engine.initialize().unwrap();
        engine.rotate_keys().unwrap();
        engine.purge_retired_keys().unwrap();
        engine.shutdown();

        let events: Vec<_> = engine.audit_records().iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![
                KeyEvent::Initialized,
                KeyEvent::Rotated,
                KeyEvent::RetiredPurged,
                KeyEvent::Wiped
            ]
        );
    }
}
