//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use secret_engine::{EncryptionEngine, EngineConfig};

pub const KEY_K1: [u8; 32] = [0x11; 32];

/// Write `bytes` as the active key file with mode 0600.
pub fn write_key(dir: &Path, bytes: &[u8]) -> PathBuf {
    write_file_0600(&dir.join("kek.key"), bytes)
}

pub fn write_file_0600(path: &Path, bytes: &[u8]) -> PathBuf {
    fs::write(path, bytes).expect("write key file");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).expect("chmod key file");
    }
    path.to_path_buf()
}

pub fn config_for(dir: &Path) -> EngineConfig {
    EngineConfig::new().with_key_dir(dir)
}

/// An initialized engine over a fresh 32-byte key in `dir`.
pub fn ready_engine(dir: &Path) -> EncryptionEngine {
    write_key(dir, &KEY_K1);
    let engine = EncryptionEngine::new(config_for(dir));
    engine.initialize().expect("initialize");
    engine
}
