//! Key lifecycle audit trail.
//!
//! Records every change to the engine's key state. The log is append-only
//! and never contains key bytes. Sinks can forward records to files or any
//! other persistent store.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::KeyVersion;

/// A sink that receives audit records.
pub trait AuditSink: Send {
    /// Append a record. Called for every lifecycle event.
    fn append(&mut self, record: AuditRecord);
}

/// What happened to the key state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEvent {
    /// A missing key file was created.
    Generated,
    /// Keys were loaded and the engine became ready.
    Initialized,
    /// The active key was replaced.
    Rotated,
    /// Retired keys were wiped and the previous key file removed.
    RetiredPurged,
    /// All key material was zeroed at shutdown.
    Wiped,
}

/// A permanent record of a key lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event: KeyEvent,
    /// Active key version after the event, if any key is active.
    pub key_version: Option<KeyVersion>,
    /// Key version superseded by a rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<KeyVersion>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(event: KeyEvent, key_version: Option<KeyVersion>) -> Self {
        Self {
            event,
            key_version,
            previous_version: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_previous(mut self, previous: KeyVersion) -> Self {
        self.previous_version = Some(previous);
        self
    }
}

/// An append-only log of lifecycle events.
#[derive(Default)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records)
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink that receives a copy of every record.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    pub fn append(&mut self, record: AuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AuditRecord> {
        self.records.iter()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines to a file, appending if it exists.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(err) = writeln!(self.file, "{line}").and_then(|_| self.file.flush()) {
                    tracing::warn!(error = %err, "audit sink write failed");
                }
            }
            Err(err) => tracing::warn!(error = %err, "audit record did not serialize"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut log = AuditLog::new();
        log.add_forward_sink(Box::new(FileAuditSink::new(&path).unwrap()));

        log.append(AuditRecord::new(KeyEvent::Initialized, Some(KeyVersion::new("kv-01"))));
        log.append(
            AuditRecord::new(KeyEvent::Rotated, Some(KeyVersion::new("kv-02")))
                .with_previous(KeyVersion::new("kv-01")),
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let rotated: AuditRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(rotated.event, KeyEvent::Rotated);
        assert_eq!(rotated.previous_version, Some(KeyVersion::new("kv-01")));
        assert_eq!(log.len(), 2);
    }
}
