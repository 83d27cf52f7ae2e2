use log::{debug, error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cursor::CursorStore;
use crate::utils::error::{AppError, AppResult};
use crate::utils::fs::write_atomic;

/// On-disk layout of the checkpoint file
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Checkpoint {
    /// Completed files and their final record count
    #[serde(default)]
    uploaded_file: HashMap<String, i64>,

    /// Files still in progress and their running count
    #[serde(default)]
    upload_progress: HashMap<String, i64>,
}

/// Progress kept in memory and written to a JSON file on an interval.
///
/// Anything recorded since the last flush is lost on a crash; those records
/// are uploaded again on the next start.
pub struct FileCursor {
    path: PathBuf,
    state: Mutex<Checkpoint>,
    io: Mutex<()>,
    flusher: Mutex<Option<CancellationToken>>,
}

impl FileCursor {
    /// Load the checkpoint at `path`, creating it if missing
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Checkpoint::default(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                AppError::CursorError(format!("invalid cursor file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => Checkpoint::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            "Loaded cursor file {} ({} completed, {} in progress)",
            path.display(),
            state.uploaded_file.len(),
            state.upload_progress.len()
        );

        let cursor = Self {
            path,
            state: Mutex::new(state),
            io: Mutex::new(()),
            flusher: Mutex::new(None),
        };
        // Fail now rather than at the first timer tick if the path is not writable.
        cursor.flush()?;
        Ok(cursor)
    }

    /// Flush every `interval` until [`CursorStore::close`]
    pub fn start_flusher(self: &Arc<Self>, interval: Duration) {
        let token = CancellationToken::new();
        let child = token.clone();
        let cursor = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cursor) = cursor.upgrade() else { break };
                        if let Err(e) = cursor.flush() {
                            error!("Failed to flush cursor file={} error={}", cursor.path.display(), e);
                        }
                    }
                }
            }
        });
        if let Some(previous) = self.flusher.lock().replace(token) {
            previous.cancel();
        }
    }

    /// Write the whole map atomically (temp file + rename)
    pub fn flush(&self) -> AppResult<()> {
        let _io = self.io.lock();
        let content = serde_json::to_vec(&*self.state.lock())?;
        write_atomic(&self.path, &content)?;
        debug!("Flushed cursor file {} ({} bytes)", self.path.display(), content.len());
        Ok(())
    }
}

impl CursorStore for FileCursor {
    fn record_uploaded(&self, file: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        if let Some(count) = state.uploaded_file.get_mut(file) {
            *count += 1;
            return Ok(());
        }
        *state.upload_progress.entry(file.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn mark_completed(&self, file: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.uploaded_file.contains_key(file) {
            return Ok(());
        }
        let count = state.upload_progress.remove(file).unwrap_or(0);
        state.uploaded_file.insert(file.to_string(), count);
        Ok(())
    }

    fn is_completed(&self, file: &str) -> AppResult<bool> {
        Ok(self.state.lock().uploaded_file.contains_key(file))
    }

    fn uploaded_count(&self, file: &str) -> AppResult<i64> {
        let state = self.state.lock();
        Ok(state
            .upload_progress
            .get(file)
            .or_else(|| state.uploaded_file.get(file))
            .copied()
            .unwrap_or(0))
    }

    fn close(&self) -> AppResult<()> {
        if let Some(token) = self.flusher.lock().take() {
            token.cancel();
        }
        self.flush()
    }
}
