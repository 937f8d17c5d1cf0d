//! Auth-token field encryption.
//!
//! A thin consumer of `EncryptionEngine`: it seals and opens the secret
//! field of token records and can re-encrypt every stored token under the
//! active key. The disabled-mode policy lives entirely in the engine.
//!
//! The sweep never rotates keys itself. To migrate tokens to a new key,
//! call `EncryptionEngine::rotate_keys` first (with retired keys retained),
//! then `TokenCipher::reencrypt_all`, then optionally
//! `EncryptionEngine::purge_retired_keys`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::engine::EncryptionEngine;
use crate::error::Result;
use crate::format;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
    Api,
}

/// A stored token record. `ciphertext` and `metadata` are exactly what the
/// engine returned; in disabled mode `ciphertext` holds the raw token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: String,
    pub kind: TokenKind,
    pub owner: String,
    pub ciphertext: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("ciphertext", &format_args!("[{} bytes]", self.ciphertext.len()))
            .finish()
    }
}

/// Storage collaborator holding token records.
pub trait TokenStore: Send + Sync {
    fn list(&self) -> Result<Vec<String>>;
    fn get(&self, id: &str) -> Result<Option<AuthToken>>;
    fn put(&self, token: AuthToken) -> Result<()>;
}

/// In-memory token store for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct MemoryTokenStore {
    inner: Arc<RwLock<BTreeMap<String, AuthToken>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn list(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().keys().cloned().collect())
    }

    fn get(&self, id: &str) -> Result<Option<AuthToken>> {
        Ok(self.inner.read().get(id).cloned())
    }

    fn put(&self, token: AuthToken) -> Result<()> {
        self.inner.write().insert(token.id.clone(), token);
        Ok(())
    }
}

/// Outcome of a re-encryption sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub reencrypted: usize,
    /// Records already sealed under the active key.
    pub current: usize,
    /// Records that could not be migrated, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Encrypts and decrypts token secrets through the engine.
#[derive(Clone)]
pub struct TokenCipher {
    engine: Arc<EncryptionEngine>,
}

impl TokenCipher {
    pub fn new(engine: Arc<EncryptionEngine>) -> Self {
        Self { engine }
    }

    pub fn seal(
        &self,
        id: impl Into<String>,
        kind: TokenKind,
        owner: impl Into<String>,
        secret: &[u8],
    ) -> Result<AuthToken> {
        let (ciphertext, metadata) = self.engine.encrypt_secret(secret)?;
        Ok(AuthToken {
            id: id.into(),
            kind,
            owner: owner.into(),
            ciphertext,
            metadata,
        })
    }

    pub fn open(&self, token: &AuthToken) -> Result<Vec<u8>> {
        self.engine.decrypt_secret(&token.ciphertext)
    }

    /// Re-encrypt every stored token under the active key, one record at a
    /// time. Per-record failures are collected, not fatal.
    #[instrument(skip_all)]
    pub fn reencrypt_all(&self, store: &dyn TokenStore) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        if !self.engine.is_enabled() {
            return Ok(report);
        }
        let active = self.engine.key_version()?;

        for id in store.list()? {
            let Some(token) = store.get(&id)? else {
                continue;
            };
            report.scanned += 1;

            let up_to_date = format::deserialize_metadata(&token.metadata)
                .map(|m| m.key_version == active)
                .unwrap_or(false);
            if up_to_date {
                report.current += 1;
                continue;
            }

            match self.migrate(token) {
                Ok(updated) => {
                    store.put(updated)?;
                    report.reencrypted += 1;
                }
                Err(err) => {
                    warn!(token = %id, error = %err, "token could not be re-encrypted");
                    report.failed.push((id, err.to_string()));
                }
            }
        }

        info!(
            scanned = report.scanned,
            reencrypted = report.reencrypted,
            failed = report.failed.len(),
            "token sweep finished"
        );
        Ok(report)
    }

    fn migrate(&self, token: AuthToken) -> Result<AuthToken> {
        let secret = self.open(&token)?;
        let (ciphertext, metadata) = self.engine.encrypt_secret(&secret)?;
        Ok(AuthToken {
            ciphertext,
            metadata,
            ..token
        })
    }
}
