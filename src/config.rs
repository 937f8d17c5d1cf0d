//! Engine configuration.
//!
//! Loaded from TOML or assembled in code with the `with_*` builders. Every
//! field has a default, so a partial file (or no file at all) is valid.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crypto::Algorithm;
use crate::error::{EngineError, Result};

pub const DEFAULT_KEY_PATH: &str = "keys/kek.key";
pub const DEFAULT_PREVIOUS_KEY_PATH: &str = "keys/kek.previous.key";
pub const DEFAULT_CHUNK_SIZE_KB: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// When false, encrypt/decrypt are identity functions and no key is loaded.
    pub enabled: bool,
    /// Cipher used for new encryptions.
    pub algorithm: Algorithm,
    /// Active key file (32 raw bytes).
    pub key_path: PathBuf,
    /// Where the superseded key is kept after a rotation.
    pub previous_key_path: PathBuf,
    /// Treat wrong mode or owner on a key file as fatal.
    pub strict_permissions: bool,
    /// Reset key file mode to 0600 when it is wrong.
    pub fix_permissions: bool,
    /// Create the active key file when it is missing. Ignored under strict policy.
    pub auto_generate: bool,
    /// Keep superseded keys so older ciphertext stays readable.
    pub retain_retired_keys: bool,
    /// Default chunk size for large secrets, in KiB.
    pub chunk_size_kb: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: Algorithm::default(),
            key_path: PathBuf::from(DEFAULT_KEY_PATH),
            previous_key_path: PathBuf::from(DEFAULT_PREVIOUS_KEY_PATH),
            strict_permissions: true,
            fix_permissions: false,
            auto_generate: false,
            retain_retired_keys: true,
            chunk_size_kb: DEFAULT_CHUNK_SIZE_KB,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration with encryption turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Place both key files inside `dir` with the default file names.
    pub fn with_key_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.key_path = dir.join("kek.key");
        self.previous_key_path = dir.join("kek.previous.key");
        self
    }

    pub fn with_key_paths(mut self, key: impl Into<PathBuf>, previous: impl Into<PathBuf>) -> Self {
        self.key_path = key.into();
        self.previous_key_path = previous.into();
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_strict_permissions(mut self, strict: bool) -> Self {
        self.strict_permissions = strict;
        self
    }

    pub fn with_fix_permissions(mut self, fix: bool) -> Self {
        self.fix_permissions = fix;
        self
    }

    pub fn with_auto_generate(mut self, generate: bool) -> Self {
        self.auto_generate = generate;
        self
    }

    pub fn with_retain_retired_keys(mut self, retain: bool) -> Self {
        self.retain_retired_keys = retain;
        self
    }

    pub fn with_chunk_size_kb(mut self, kb: usize) -> Self {
        self.chunk_size_kb = kb;
        self
    }

    /// Load config from a TOML file; if missing or empty, return defaults.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_kb == 0 {
            return Err(EngineError::Config("chunk_size_kb must be greater than zero".into()));
        }
        if self.key_path == self.previous_key_path {
            return Err(EngineError::Config(
                "key_path and previous_key_path must differ".into(),
            ));
        }
        Ok(())
    }

    /// Auto-generation only applies when strict permissions are off.
    pub(crate) fn may_generate(&self) -> bool {
        self.auto_generate && !self.strict_permissions
    }
}
