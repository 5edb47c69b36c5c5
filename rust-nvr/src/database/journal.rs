//! Terminal-write journal.
//!
//! Append-only JSON-lines file holding terminal history transitions whose
//! primary database write failed. The journal is replayed at startup so a
//! crash between "encoder exited" and "history row finalized" cannot lose
//! the terminal state. Replay goes through the repository's guarded update,
//! so a row that already reached a terminal state is never downgraded.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::database::models::RecordingStatus;
use crate::database::repositories::RecordingHistoryRepository;
use crate::database::time;
use crate::utils::fs::io_error;
use crate::Result;

/// One journaled terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalWrite {
    pub history_id: i64,
    pub status: RecordingStatus,
    pub end_time_ms: i64,
    pub error_message: Option<String>,
}

/// Append-only journal of terminal history writes.
pub struct TerminalJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TerminalJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and fsync it.
    pub async fn append(&self, entry: &TerminalWrite) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.write_lock.lock().await;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| io_error("opening journal", &self.path, e))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| io_error("writing journal", &self.path, e))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| io_error("writing journal", &self.path, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("syncing journal", &self.path, e))?;
        Ok(())
    }

    /// Replay journaled transitions into the history store.
    ///
    /// Applied and already-terminal entries are dropped; garbled lines are
    /// dropped with a warning; entries whose database write still fails are
    /// kept for the next replay. Returns the number of applied transitions.
    pub async fn replay(&self, repo: &dyn RecordingHistoryRepository) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error("reading journal", &self.path, e)),
        };

        let mut applied = 0usize;
        let mut retained: Vec<String> = Vec::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: TerminalWrite = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Dropping garbled journal line");
                    continue;
                }
            };

            match repo
                .update_terminal(
                    entry.history_id,
                    entry.status,
                    time::ms_to_datetime(entry.end_time_ms),
                    entry.error_message.as_deref(),
                )
                .await
            {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(crate::Error::NotFound { .. }) => {
                    warn!(
                        history_id = entry.history_id,
                        "Journaled row no longer exists, dropping entry"
                    );
                }
                Err(e) => {
                    warn!(
                        history_id = entry.history_id,
                        error = %e,
                        "Journal replay write failed, keeping entry"
                    );
                    retained.push(line.to_string());
                }
            }
        }

        let mut remaining = retained.join("\n");
        if !remaining.is_empty() {
            remaining.push('\n');
        }
        tokio::fs::write(&self.path, remaining)
            .await
            .map_err(|e| io_error("rewriting journal", &self.path, e))?;

        if applied > 0 {
            info!(applied, "Replayed terminal writes from journal");
        }
        Ok(applied)
    }
}
