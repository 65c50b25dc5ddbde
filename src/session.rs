//! Session persistence — one JSON document per session id under
//! `<home>/.wave/sessions`, with restore-by-id, continue-latest, and
//! startup TTL cleanup.
//!
//! Save failures are transient: they are logged and reported without
//! aborting the turn. Restoration failures are fatal to the embedding
//! process — the caller is expected to exit with the error message.

use crate::ledger::Ledger;
use crate::paths::WaveDirs;
use crate::types::Message;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Sessions untouched for this long are removed on startup cleanup.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("no previous session in {}", .0.display())]
    NothingToContinue(PathBuf),
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("session file {} is malformed: {source}", path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// How to restore state at startup.
#[derive(Debug, Clone)]
pub enum Restore {
    /// Restore a specific session by id.
    ById(String),
    /// Continue the most recent session recorded for the current workdir.
    Latest,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    id: String,
    workdir: PathBuf,
    #[serde(rename = "startedAt")]
    started_at: u64,
    #[serde(default)]
    metadata: SessionMetadata,
    messages: Vec<Message>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionMetadata {
    #[serde(rename = "latestTotalTokens", default)]
    latest_total_tokens: u64,
}

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dirs: &WaveDirs) -> Self {
        Self {
            dir: dirs.sessions(),
        }
    }

    /// Use an explicit session directory (tests).
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    /// Persist the ledger's current state. Failures are logged and returned;
    /// callers continue the turn either way.
    pub fn save(&self, ledger: &Ledger) -> Result<PathBuf, SessionError> {
        let file = SessionFile {
            id: ledger.session_id().to_string(),
            workdir: ledger.workdir().to_path_buf(),
            started_at: ledger.started_at(),
            metadata: SessionMetadata {
                latest_total_tokens: ledger.latest_total_tokens(),
            },
            messages: ledger.messages().to_vec(),
        };
        let path = self.path_for(&file.id);
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.dir)?;
            let json = serde_json::to_string_pretty(&file)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(&path, json)
        };
        let result = write().map_err(|source| SessionError::Io {
            path: path.clone(),
            source,
        });
        match result {
            Ok(()) => {
                debug!(session = %file.id, path = %path.display(), "session saved");
                Ok(path)
            }
            Err(e) => {
                warn!("failed to save session: {e}");
                Err(e)
            }
        }
    }

    /// Replace the ledger's in-memory state with a stored session. The input
    /// history is recomputed from the restored user messages.
    pub fn restore(&self, ledger: &mut Ledger, mode: Restore) -> Result<(), SessionError> {
        let path = match mode {
            Restore::ById(id) => {
                let path = self.path_for(&id);
                if !path.exists() {
                    return Err(SessionError::NotFound(id));
                }
                path
            }
            Restore::Latest => self
                .latest_for_workdir(ledger.workdir())?
                .ok_or_else(|| SessionError::NothingToContinue(ledger.workdir().to_path_buf()))?,
        };
        let file = self.read_session(&path)?;
        debug!(session = %file.id, "session restored");
        ledger.restore(
            file.id,
            file.workdir,
            file.started_at,
            file.metadata.latest_total_tokens,
            file.messages,
        );
        Ok(())
    }

    /// Delete session files whose modification time is older than `ttl`.
    /// Returns how many were removed; individual failures are logged and
    /// skipped.
    pub fn cleanup_expired(&self, ttl: Duration) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > ttl);
            if !expired {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("failed to remove expired session {}: {e}", path.display()),
            }
        }
        removed
    }

    fn read_session(&self, path: &Path) -> Result<SessionFile, SessionError> {
        let json = std::fs::read_to_string(path).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| SessionError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Most recently modified session file recorded for `workdir`.
    fn latest_for_workdir(&self, workdir: &Path) -> Result<Option<PathBuf>, SessionError> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Ok(None);
        };
        let mut latest: Option<(SystemTime, PathBuf)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Malformed neighbors must not block `continue`; skip them.
            let Ok(file) = self.read_session(&path) else {
                warn!("skipping unreadable session file {}", path.display());
                continue;
            };
            if file.workdir != workdir {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if latest.as_ref().map_or(true, |(t, _)| modified > *t) {
                latest = Some((modified, path));
            }
        }
        Ok(latest.map(|(_, path)| path))
    }
}
