//! Entry snapshot persistence
//!
//! The store can persist its entries so a restarted daemon re-admits the
//! addresses whose TTL has not run out yet. Expiries are stored as wall-clock
//! times since the monotonic clock does not survive a restart.
//!
//! Snapshots are versioned and carry a SHA-256 checksum of the entry list.
//! Writes go to a temporary file in the same directory which is then renamed
//! over the target.

use crate::core::error::{Error, Result, SnapshotError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Current on-disk format version
pub const SNAPSHOT_VERSION: u32 = 1;

const SNAPSHOT_FILE_NAME: &str = "entries.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub target: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntrySnapshot {
    version: u32,
    checksum: String,
    entries: Vec<SnapshotEntry>,
}

/// Default snapshot location in the state directory.
pub fn default_snapshot_path() -> Option<PathBuf> {
    crate::utils::get_state_dir().map(|dir| dir.join(SNAPSHOT_FILE_NAME))
}

/// Computes the SHA-256 checksum of the canonical JSON form of the entries.
pub fn compute_checksum(entries: &[SnapshotEntry]) -> Result<String> {
    let json = serde_json::to_string(entries)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Writes the entries to `path` atomically.
///
/// # Errors
///
/// Returns `Err` if the parent directory is missing or not writable, or the
/// rename fails.
pub fn save(path: &Path, entries: &[SnapshotEntry]) -> Result<()> {
    let snapshot = EntrySnapshot {
        version: SNAPSHOT_VERSION,
        checksum: compute_checksum(entries)?,
        entries: entries.to_vec(),
    };
    let json = serde_json::to_string_pretty(&snapshot)?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    // NamedTempFile is created with mode 0o600
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(json.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;

    Ok(())
}

/// Loads and verifies a snapshot. A missing file yields no entries.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read, is not a snapshot, has a
/// different format version, or fails the checksum.
pub fn load(path: &Path) -> Result<Vec<SnapshotEntry>> {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let snapshot: EntrySnapshot =
        serde_json::from_str(&json).map_err(|_| SnapshotError::Corrupted)?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::VersionMismatch {
            found: snapshot.version,
            expected: SNAPSHOT_VERSION,
        }
        .into());
    }

    let actual = compute_checksum(&snapshot.entries)?;
    if actual != snapshot.checksum {
        return Err(SnapshotError::ChecksumMismatch {
            expected: snapshot.checksum,
            actual,
        }
        .into());
    }

    info!(
        "Loaded {} entr{} from {}",
        snapshot.entries.len(),
        if snapshot.entries.len() == 1 { "y" } else { "ies" },
        path.display()
    );
    Ok(snapshot.entries)
}
