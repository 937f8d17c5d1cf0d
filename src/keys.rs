//! Key material ownership and the file-backed key manager.
//!
//! This module owns two responsibilities:
//! 1. Holding raw key bytes in types that are opaque, non-cloneable and
//!    zeroised on drop.
//! 2. Loading, validating, rotating and wiping the key files the engine is
//!    configured with.
//!
//! ## Key files
//!
//! ```text
//! key_path           active key, 32 raw bytes, mode 0600
//! previous_key_path  key superseded by the last rotation (optional)
//! ```
//!
//! ## Key versions
//!
//! A key's version is `kv-` followed by the first 8 bytes (hex) of
//! `HMAC-SHA256(key, "secret-engine key version")`. It is derived, not
//! stored, so it survives restarts without a separate version file.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ring::hmac;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::EngineConfig;
use crate::crypto::{self, KEY_LEN};
use crate::error::{EngineError, Result};
use crate::permissions::{OwnerOnly, PermissionCheck, PermissionWarning, ValidationReport};

const VERSION_LABEL: &[u8] = b"secret-engine key version";
const VERSION_PREFIX: &str = "kv-";
const VERSION_BYTES: usize = 8;

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// Raw symmetric key bytes.
///
/// - Not `Clone`. Cannot be duplicated without explicit conversion.
/// - Zeroised on drop, and on demand through `wipe`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: [u8; KEY_LEN],
}

impl KeyMaterial {
    /// Construct key material from raw bytes supplied by the caller.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Generate fresh random key material.
    pub fn generate() -> Result<Self> {
        let mut material = Self::from_bytes([0u8; KEY_LEN]);
        crypto::fill_random_key(&mut material.bytes)?;
        Ok(material)
    }

    /// Borrow the raw key bytes to build a cipher context.
    ///
    /// Raw bytes never leave the crate.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// The version identifier derived from these bytes.
    pub fn version(&self) -> KeyVersion {
        let tag = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, &self.bytes), VERSION_LABEL);
        let hex: String = tag.as_ref()[..VERSION_BYTES]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        KeyVersion(format!("{VERSION_PREFIX}{hex}"))
    }

    /// Overwrite the key bytes with zeros.
    pub fn wipe(&mut self) {
        self.zeroize();
    }

    #[cfg(test)]
    fn is_wiped(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

/// Opaque identifier of a key generation, stamped onto every encrypted unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyVersion(String);

impl KeyVersion {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key material paired with its version.
pub struct VersionedKey {
    version: KeyVersion,
    material: KeyMaterial,
}

impl VersionedKey {
    fn new(material: KeyMaterial) -> Self {
        Self {
            version: material.version(),
            material,
        }
    }

    pub fn version(&self) -> &KeyVersion {
        &self.version
    }

    pub(crate) fn material(&self) -> &KeyMaterial {
        &self.material
    }
}

/// Result of a successful key rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub previous: KeyVersion,
    pub current: KeyVersion,
    /// Whether the superseded key is still held for decryption.
    pub retained: bool,
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.previous, self.current)
    }
}

// ---------------------------------------------------------------------------
// Key manager
// ---------------------------------------------------------------------------

/// Exclusive custodian of the active key and any retired keys.
pub struct KeyManager {
    key_path: PathBuf,
    previous_key_path: PathBuf,
    strict: bool,
    fix_permissions: bool,
    may_generate: bool,
    retain_retired: bool,
    checker: Arc<dyn PermissionCheck>,
    active: Option<VersionedKey>,
    retired: Vec<VersionedKey>,
}

impl KeyManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            key_path: config.key_path.clone(),
            previous_key_path: config.previous_key_path.clone(),
            strict: config.strict_permissions,
            fix_permissions: config.fix_permissions,
            may_generate: config.may_generate(),
            retain_retired: config.retain_retired_keys,
            checker: Arc::new(OwnerOnly),
            active: None,
            retired: Vec::new(),
        }
    }

    /// Replace the default permission collaborator.
    pub fn with_permission_check(mut self, checker: Arc<dyn PermissionCheck>) -> Self {
        self.checker = checker;
        self
    }

    /// Load the key files, generating the active key first if policy allows.
    ///
    /// Any missing or malformed file is fatal. Permission warnings are fatal
    /// only under strict policy; otherwise they are returned in the report.
    pub fn initialize(&mut self) -> Result<ValidationReport> {
        let mut generated = None;
        if !self.key_path.exists() {
            if !self.may_generate {
                return Err(EngineError::KeyLoad {
                    path: self.key_path.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "key file not found"),
                });
            }
            let material = KeyMaterial::generate()?;
            write_key_file(&self.key_path, material.as_bytes())?;
            info!(path = %self.key_path.display(), version = %material.version(), "generated new key file");
            generated = Some(self.key_path.clone());
        }

        let mut report = self.validate_key_files()?;
        report.generated = generated;
        if self.strict {
            if let Some(warning) = report.warnings.first() {
                return Err(EngineError::Permission(warning.to_string()));
            }
        }

        let active = VersionedKey::new(read_key_file(&self.key_path)?);
        let mut retired = Vec::new();
        if self.retain_retired && self.previous_key_path.exists() {
            let previous = VersionedKey::new(read_key_file(&self.previous_key_path)?);
            if previous.version != active.version {
                debug!(version = %previous.version, "loaded previous key");
                retired.push(previous);
            }
        }

        info!(version = %active.version, retired = retired.len(), "key manager initialized");
        self.active = Some(active);
        self.retired = retired;
        Ok(report)
    }

    /// Re-check size, mode and ownership of the key files.
    ///
    /// A missing active file or a wrong-sized file is an error. Mode issues
    /// are repaired when `fix_permissions` is set; everything else becomes a
    /// warning in the report.
    pub fn validate_key_files(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();

        for (path, required) in [(&self.key_path, true), (&self.previous_key_path, false)] {
            let meta = match fs::metadata(path) {
                Ok(meta) => meta,
                Err(err) if err.kind() == io::ErrorKind::NotFound && !required => continue,
                Err(source) => {
                    return Err(EngineError::KeyLoad {
                        path: path.clone(),
                        source,
                    })
                }
            };
            if meta.len() != KEY_LEN as u64 {
                return Err(EngineError::KeyFormat {
                    path: path.clone(),
                    len: meta.len() as usize,
                });
            }

            let issues = self
                .checker
                .inspect(path)
                .map_err(|source| EngineError::KeyLoad {
                    path: path.clone(),
                    source,
                })?;

            let mut fixed = false;
            for issue in issues {
                if issue.is_fixable() && self.fix_permissions {
                    match self.checker.restrict(path) {
                        Ok(()) => {
                            info!(path = %path.display(), %issue, "restricted key file mode");
                            fixed = true;
                            continue;
                        }
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "could not restrict key file mode");
                        }
                    }
                }
                warn!(path = %path.display(), %issue, "insecure key file");
                report.warnings.push(PermissionWarning {
                    path: path.clone(),
                    issue,
                });
            }
            if fixed {
                report.fixed.push(path.clone());
            }
            report.checked.push(path.clone());
        }

        Ok(report)
    }

    pub fn is_loaded(&self) -> bool {
        self.active.is_some()
    }

    /// The active key-encrypting key.
    pub fn kek(&self) -> Result<&KeyMaterial> {
        self.active
            .as_ref()
            .map(VersionedKey::material)
            .ok_or(EngineError::NotInitialized)
    }

    pub fn key_version(&self) -> Result<&KeyVersion> {
        self.active
            .as_ref()
            .map(VersionedKey::version)
            .ok_or(EngineError::NotInitialized)
    }

    /// Superseded keys still held for decryption. At most one.
    pub fn retired(&self) -> &[VersionedKey] {
        &self.retired
    }

    /// Replace the active key with freshly generated material.
    pub fn rotate_key(&mut self) -> Result<Rotation> {
        self.rotate_to(KeyMaterial::generate()?)
    }

    /// Replace the active key with `material`.
    ///
    /// With retention on, the current key is written to `previous_key_path`
    /// and kept in memory as the single retired key. A second rotation is
    /// refused with `RetiredKeyPending` until `purge_retired` has run, since
    /// the previous key file holds exactly one key. With retention off the
    /// current key is wiped and any previous key file is removed.
    ///
    /// The new key is persisted before the in-memory swap, so a failed write
    /// leaves the active key untouched. Stored ciphertext is not re-encrypted.
    pub fn rotate_to(&mut self, material: KeyMaterial) -> Result<Rotation> {
        let next = VersionedKey::new(material);
        let current = self.active.as_ref().ok_or(EngineError::NotInitialized)?;
        if next.version == current.version {
            return Err(EngineError::InvalidKey);
        }

        if self.retain_retired {
            if let Some(pending) = self.retired.first() {
                warn!(retired = %pending.version, "rotation refused until the retired key is purged");
                return Err(EngineError::RetiredKeyPending(pending.version.to_string()));
            }
            write_key_file(&self.previous_key_path, current.material.as_bytes())?;
            write_key_file(&self.key_path, next.material.as_bytes())?;
        } else {
            remove_key_file(&self.previous_key_path)?;
            write_key_file(&self.key_path, next.material.as_bytes())?;
        }

        let current_version = next.version.clone();
        let mut old = match self.active.replace(next) {
            Some(old) => old,
            None => return Err(EngineError::NotInitialized),
        };
        let previous = old.version.clone();

        if self.retain_retired {
            self.retired.push(old);
        } else {
            old.material.wipe();
            self.retired.clear();
        }

        info!(%previous, current = %current_version, retained = self.retain_retired, "rotated key");
        Ok(Rotation {
            previous,
            current: current_version,
            retained: self.retain_retired,
        })
    }

    /// Remove the previous key file, then wipe every retired key.
    ///
    /// If the file cannot be removed nothing is wiped, so memory and disk
    /// stay in agreement.
    pub fn purge_retired(&mut self) -> Result<usize> {
        remove_key_file(&self.previous_key_path)?;

        let count = self.retired.len();
        for key in self.retired.iter_mut() {
            key.material.wipe();
        }
        self.retired.clear();
        info!(count, "purged retired keys");
        Ok(count)
    }

    /// Zero all key bytes held in memory and forget them.
    pub fn wipe(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.material.wipe();
        }
        for key in self.retired.iter_mut() {
            key.material.wipe();
        }
        self.retired.clear();
        debug!("key material wiped");
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Read a key file, enforcing the exact key length. The bytes are copied
/// straight into the returned `KeyMaterial`; the read buffer is zeroised.
fn read_key_file(path: &Path) -> Result<KeyMaterial> {
    let data = Zeroizing::new(fs::read(path).map_err(|source| EngineError::KeyLoad {
        path: path.to_path_buf(),
        source,
    })?);
    if data.len() != KEY_LEN {
        return Err(EngineError::KeyFormat {
            path: path.to_path_buf(),
            len: data.len(),
        });
    }
    let mut material = KeyMaterial::from_bytes([0u8; KEY_LEN]);
    material.bytes.copy_from_slice(&data);
    Ok(material)
}

/// Delete a key file. A file that is already gone is not an error.
fn remove_key_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(EngineError::KeyWrite {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Atomically write key bytes with mode 0600.
fn write_key_file(path: &Path, bytes: &[u8; KEY_LEN]) -> Result<()> {
    let write_err = |source: io::Error| EngineError::KeyWrite {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_err)?;

    // NamedTempFile is created 0600 on unix.
    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
