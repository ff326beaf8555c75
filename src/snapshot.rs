//! Snapshot persistence: the whole index state in one file.
//!
//! The file holds the schema and every stored document. Each write goes to
//! its own temp file next to the target, is synced, then renamed over it, so
//! concurrent writers never share a file and readers only see whole snapshots.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::config::ServerSettings;
use crate::errors::IndexerError;
use crate::index::LogIndex;
use crate::metrics::SNAPSHOTS_WRITTEN;
use crate::schema::{Document, IndexSchema};

const SNAPSHOT_VERSION: u32 = 1;

/// Encoding of the snapshot file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    #[default]
    Json,
    /// MessagePack
    Binary,
}

impl fmt::Display for SnapshotFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotFormat::Json => f.write_str("json"),
            SnapshotFormat::Binary => f.write_str("binary"),
        }
    }
}

impl FromStr for SnapshotFormat {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(SnapshotFormat::Json),
            "binary" | "msgpack" => Ok(SnapshotFormat::Binary),
            other => Err(IndexerError::InvalidSetting(
                "snapshot.format",
                format!("unknown format {other:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: u64,
    pub document: Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub schema: IndexSchema,
    pub documents: Vec<StoredDocument>,
}

impl Snapshot {
    pub fn new(schema: IndexSchema, documents: Vec<StoredDocument>) -> Self {
        Snapshot {
            version: SNAPSHOT_VERSION,
            created_at: Utc::now(),
            schema,
            documents,
        }
    }
}

pub fn encode(snapshot: &Snapshot, format: SnapshotFormat) -> Result<Vec<u8>, IndexerError> {
    match format {
        SnapshotFormat::Json => serde_json::to_vec(snapshot).map_err(IndexerError::SnapshotJson),
        // Named fields keep the file readable by other MessagePack tools
        SnapshotFormat::Binary => Ok(rmp_serde::to_vec_named(snapshot)?),
    }
}

pub fn decode(bytes: &[u8], format: SnapshotFormat) -> Result<Snapshot, IndexerError> {
    let snapshot: Snapshot = match format {
        SnapshotFormat::Json => serde_json::from_slice(bytes).map_err(IndexerError::SnapshotJson)?,
        SnapshotFormat::Binary => rmp_serde::from_slice(bytes)?,
    };
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(IndexerError::SnapshotVersion(snapshot.version));
    }
    Ok(snapshot)
}

/// Write the index to `path`, replacing any previous snapshot.
///
/// Returns the number of documents written.
pub fn persist(index: &LogIndex, path: &Path, format: SnapshotFormat) -> Result<usize, IndexerError> {
    let snapshot = index.to_snapshot();
    let count = snapshot.documents.len();
    let bytes = encode(&snapshot, format)?;

    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            fs::create_dir_all(parent)?;
            parent
        }
        None => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    SNAPSHOTS_WRITTEN.inc();
    info!(path = %path.display(), %format, documents = count, bytes = bytes.len(), "Wrote snapshot");
    Ok(count)
}

/// Read the snapshot at `path`. `Ok(None)` when there is no file yet.
pub fn restore(path: &Path, format: SnapshotFormat) -> Result<Option<Snapshot>, IndexerError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    decode(&bytes, format).map(Some)
}

/// Restore the index from the configured snapshot, or create an empty one.
pub fn open_or_create(settings: &ServerSettings) -> Result<LogIndex, IndexerError> {
    let path = &settings.snapshot.path;
    match restore(path, settings.snapshot.format)? {
        Some(snapshot) => {
            if snapshot.schema != settings.schema {
                warn!(
                    path = %path.display(),
                    "Snapshot schema differs from the configured schema; keeping the snapshot's"
                );
            }
            info!(
                path = %path.display(),
                documents = snapshot.documents.len(),
                created_at = %snapshot.created_at,
                "Restoring index from snapshot"
            );
            LogIndex::from_snapshot(snapshot, settings.writer_heap_bytes)
        }
        None => {
            info!(path = %path.display(), "No snapshot found, starting with an empty index");
            LogIndex::create(settings.schema.clone(), settings.writer_heap_bytes)
        }
    }
}
