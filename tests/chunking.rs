//! Large-secret chunking: boundaries, ordering and set integrity.

mod common;

use secret_engine::{deserialize_encrypted_data, deserialize_metadata, EngineError};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[test]
fn chunk_count_is_ceiling_of_size() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::ready_engine(dir.path());

    // 1. 150 KiB at 64 KiB chunks -> 3 chunks
    let plaintext = payload(150 * 1024);
    let (blobs, metadata) = engine.encrypt_large_secret(&plaintext, 64).unwrap();
    assert_eq!(blobs.len(), 3);
    assert_eq!(metadata.len(), 3);

    // 2. Every record carries its index and the total
    for (i, record) in metadata.iter().enumerate() {
        let meta = deserialize_metadata(record).unwrap();
        assert_eq!(meta.chunk_index, Some(i as u32));
        assert_eq!(meta.chunk_count, Some(3));
    }

    // 3. Exact multiple: no trailing empty chunk
    let (exact, _) = engine.encrypt_large_secret(&payload(128 * 1024), 64).unwrap();
    assert_eq!(exact.len(), 2);

    assert_eq!(engine.decrypt_large_secret(&blobs).unwrap(), plaintext);
}

#[test]
fn zero_selects_configured_chunk_size() {
    let dir = tempfile::tempdir().unwrap();
    common::write_key(dir.path(), &common::KEY_K1);
    let engine = secret_engine::EncryptionEngine::new(
        common::config_for(dir.path()).with_chunk_size_kb(1),
    );
    engine.initialize().unwrap();

    let plaintext = payload(2500);
    let (blobs, _) = engine.encrypt_large_secret(&plaintext, 0).unwrap();
    assert_eq!(blobs.len(), 3);
    assert_eq!(engine.decrypt_large_secret(&blobs).unwrap(), plaintext);
}

#[test]
fn chunks_reassemble_in_any_order() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::ready_engine(dir.path());

    let plaintext = payload(5 * 1024 + 17);
    let (mut blobs, _) = engine.encrypt_large_secret(&plaintext, 1).unwrap();
    assert_eq!(blobs.len(), 6);

    blobs.reverse();
    blobs.swap(1, 4);
    assert_eq!(engine.decrypt_large_secret(&blobs).unwrap(), plaintext);
}

#[test]
fn missing_chunk_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::ready_engine(dir.path());

    let (mut blobs, _) = engine.encrypt_large_secret(&payload(4096), 1).unwrap();
    blobs.remove(2);
    assert!(matches!(
        engine.decrypt_large_secret(&blobs),
        Err(EngineError::ChunkIntegrity(_))
    ));
}

#[test]
fn duplicated_chunk_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::ready_engine(dir.path());

    let (mut blobs, _) = engine.encrypt_large_secret(&payload(3072), 1).unwrap();
    blobs[2] = blobs[1].clone();
    assert!(matches!(
        engine.decrypt_large_secret(&blobs),
        Err(EngineError::ChunkIntegrity(_))
    ));
}

#[test]
fn chunk_from_another_set_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::ready_engine(dir.path());

    let (mut three, _) = engine.encrypt_large_secret(&payload(3072), 1).unwrap();
    let (two, _) = engine.encrypt_large_secret(&payload(2048), 1).unwrap();
    three[0] = two[0].clone();
    assert!(matches!(
        engine.decrypt_large_secret(&three),
        Err(EngineError::ChunkIntegrity(_))
    ));
}

#[test]
fn tampered_chunk_reports_its_index() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::ready_engine(dir.path());

    let (mut blobs, _) = engine.encrypt_large_secret(&payload(3072), 1).unwrap();
    let last = blobs[1].len() - 1;
    blobs[1][last] ^= 0x01;

    match engine.decrypt_large_secret(&blobs) {
        Err(EngineError::ChunkIntegrity(msg)) => assert!(msg.contains("chunk 1"), "{msg}"),
        other => panic!("expected chunk integrity error, got {other:?}"),
    }
}

#[test]
fn single_blob_is_not_a_chunk_set() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::ready_engine(dir.path());

    let (blob, _) = engine.encrypt_secret(b"not chunked").unwrap();
    assert!(matches!(
        engine.decrypt_large_secret(&[blob]),
        Err(EngineError::ChunkIntegrity(_))
    ));
}

#[test]
fn empty_payload_has_no_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::ready_engine(dir.path());

    let (blobs, metadata) = engine.encrypt_large_secret(b"", 4).unwrap();
    assert!(blobs.is_empty());
    assert!(metadata.is_empty());
    assert_eq!(engine.decrypt_large_secret::<Vec<u8>>(&[]).unwrap(), Vec::<u8>::new());
}

#[test]
fn chunks_are_sealed_under_the_active_key() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::ready_engine(dir.path());
    let version = engine.key_version().unwrap();

    let (blobs, _) = engine.encrypt_large_secret(&payload(2048), 1).unwrap();
    for blob in &blobs {
        assert_eq!(deserialize_encrypted_data(blob).unwrap().key_version, version);
    }
}
