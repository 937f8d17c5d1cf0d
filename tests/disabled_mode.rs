//! With encryption disabled the engine is an identity transform.

use secret_engine::{EncryptionEngine, EngineConfig, EngineError, LifecycleState};

fn disabled_engine() -> EncryptionEngine {
    let engine = EncryptionEngine::new(EngineConfig::disabled());
    engine.initialize().unwrap();
    engine
}

#[test]
fn initialize_needs_no_key_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::disabled().with_key_dir(dir.path());
    let engine = EncryptionEngine::new(config);

    let report = engine.initialize().unwrap();
    assert!(report.checked.is_empty());
    assert_eq!(engine.state(), LifecycleState::Ready);
    assert!(!engine.is_enabled());
    assert!(!dir.path().join("kek.key").exists());
}

#[test]
fn secrets_pass_through_unchanged() {
    let engine = disabled_engine();

    let (blob, metadata) = engine.encrypt_secret(b"plain").unwrap();
    assert_eq!(blob, b"plain");
    assert!(metadata.is_empty());
    assert_eq!(engine.decrypt_secret(b"anything at all").unwrap(), b"anything at all");
}

#[test]
fn pass_through_does_not_require_initialize() {
    let engine = EncryptionEngine::new(EngineConfig::disabled());
    assert_eq!(engine.encrypt_secret(b"early").unwrap().0, b"early");
    assert_eq!(engine.decrypt_secret(b"early").unwrap(), b"early");
}

#[test]
fn large_secrets_split_without_encryption() {
    let engine = disabled_engine();
    let plaintext = vec![0xABu8; 2500];

    let (chunks, metadata) = engine.encrypt_large_secret(&plaintext, 1).unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[2].len(), 2500 - 2048);
    assert!(metadata.iter().all(Vec::is_empty));
    assert_eq!(engine.decrypt_large_secret(&chunks).unwrap(), plaintext);
}

#[test]
fn key_management_reports_disabled() {
    let engine = disabled_engine();
    assert!(matches!(engine.key_version(), Err(EngineError::Disabled)));
    assert!(matches!(engine.rotate_keys(), Err(EngineError::Disabled)));
    assert!(matches!(engine.purge_retired_keys(), Err(EngineError::Disabled)));
    assert!(matches!(engine.validate_key_files(), Err(EngineError::Disabled)));
}

#[test]
fn shutdown_still_stops() {
    let engine = disabled_engine();
    engine.shutdown();
    assert_eq!(engine.state(), LifecycleState::Stopped);
    assert!(engine.audit_records().is_empty());
}
