//! Reversion log — staged file snapshots with atomic rollback across a
//! turn.
//!
//! Snapshots are buffered at record time, then either committed (content
//! persisted to the snapshots area) or discarded. Committed snapshots are
//! drained by the caller and attached to the owning message's `fileHistory`
//! block; `revert_to` walks those blocks newest-first to restore files.

use crate::paths::WaveDirs;
use crate::types::{now_ms, Block, FileSnapshot, Message, SnapshotOperation};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum RevertError {
    #[error("unknown snapshot {0}")]
    UnknownSnapshot(String),
    #[error("failed to persist snapshot: {0}")]
    Io(#[from] io::Error),
}

pub struct ReversionLog {
    snapshots_dir: PathBuf,
    buffered: HashMap<String, FileSnapshot>,
    committed: Vec<FileSnapshot>,
}

impl ReversionLog {
    pub fn new(dirs: &WaveDirs) -> Self {
        Self::at(dirs.snapshots())
    }

    /// Use an explicit snapshots directory (tests).
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshots_dir: dir.into(),
            buffered: HashMap::new(),
            committed: Vec::new(),
        }
    }

    /// Capture the file's current bytes before a mutation. Returns the
    /// snapshot id; the snapshot stays buffered until committed or
    /// discarded. A missing file records `None` content — the expected case
    /// for `Create`.
    pub fn record(
        &mut self,
        message_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        operation: SnapshotOperation,
    ) -> String {
        let file_path = file_path.into();
        let content = std::fs::read_to_string(&file_path).ok();
        let snapshot = FileSnapshot {
            message_id: message_id.into(),
            file_path,
            operation,
            timestamp: now_ms(),
            content,
            snapshot_path: None,
        };
        let id = snapshot.snapshot_id();
        self.buffered.insert(id.clone(), snapshot);
        id
    }

    /// Persist a buffered snapshot to the snapshots area and move it to the
    /// per-turn committed list. Snapshots without content (file did not
    /// exist) commit with no snapshot path.
    pub fn commit(&mut self, snapshot_id: &str) -> Result<(), RevertError> {
        let mut snapshot = self
            .buffered
            .remove(snapshot_id)
            .ok_or_else(|| RevertError::UnknownSnapshot(snapshot_id.to_string()))?;
        if let Some(content) = &snapshot.content {
            std::fs::create_dir_all(&self.snapshots_dir)?;
            let blob = self.snapshots_dir.join(blob_name(snapshot_id));
            std::fs::write(&blob, content)?;
            snapshot.snapshot_path = Some(blob);
        }
        debug!(snapshot = %snapshot_id, "snapshot committed");
        self.committed.push(snapshot);
        Ok(())
    }

    /// Drop a buffered snapshot without persisting it.
    pub fn discard(&mut self, snapshot_id: &str) -> bool {
        self.buffered.remove(snapshot_id).is_some()
    }

    /// Hand the per-turn committed list to the caller (for embedding into a
    /// `fileHistory` block) and clear it.
    pub fn drain_committed(&mut self) -> Vec<FileSnapshot> {
        std::mem::take(&mut self.committed)
    }

    /// Revert every snapshot referenced from the target messages, newest
    /// first (LIFO). Individual failures are logged and skipped; returns how
    /// many snapshots were successfully reverted.
    pub fn revert_to(&self, message_ids: &[String], messages: &[Message]) -> usize {
        let targets: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        let mut snapshots: Vec<&FileSnapshot> = messages
            .iter()
            .filter(|m| m.id.as_deref().is_some_and(|id| targets.contains(id)))
            .flat_map(|m| &m.blocks)
            .filter_map(|b| match b {
                Block::FileHistory { snapshots } => Some(snapshots.iter()),
                _ => None,
            })
            .flatten()
            .collect();
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut reverted = 0;
        for snapshot in snapshots {
            match apply(snapshot) {
                Ok(()) => reverted += 1,
                Err(e) => warn!(
                    "skipping revert of {}: {e}",
                    snapshot.file_path.display()
                ),
            }
        }
        reverted
    }
}

/// Apply a single snapshot. `Create` undoes by deletion; otherwise the
/// persisted blob is restored when present. A missing snapshot path falls
/// through to deletion — preserved for compatibility even for `Modify`.
fn apply(snapshot: &FileSnapshot) -> io::Result<()> {
    if snapshot.operation == SnapshotOperation::Create {
        return force_delete(&snapshot.file_path);
    }
    match &snapshot.snapshot_path {
        Some(blob) => {
            let content = std::fs::read_to_string(blob)?;
            if let Some(parent) = snapshot.file_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&snapshot.file_path, content)
        }
        None => force_delete(&snapshot.file_path),
    }
}

fn force_delete(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Snapshot ids embed the original file path; flatten separators so the id
/// is usable as a blob file name.
fn blob_name(snapshot_id: &str) -> String {
    snapshot_id
        .chars()
        .map(|c| if std::path::is_separator(c) { '_' } else { c })
        .collect()
}
