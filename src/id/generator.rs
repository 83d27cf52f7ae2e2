use log::{debug, error, info};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::utils::error::{AppError, AppResult};
use crate::utils::fs::write_atomic;

const CHECKPOINT_LEN: usize = 8;

/// Issues increasing record IDs and checkpoints the counter to a small file.
///
/// The counter is written on a timer rather than on every allocation. After
/// an unclean exit the IDs issued since the last checkpoint are handed out
/// again.
pub struct IdGenerator {
    /// Checkpoint file: little-endian u64
    path: PathBuf,

    flush_interval: Duration,

    /// Last issued ID
    counter: Mutex<u64>,

    /// Set by the ticker, consumed by the next allocation
    flush_due: Arc<AtomicBool>,

    /// Serializes checkpoint writes so the file never goes backwards
    io: Mutex<()>,

    ticker: Mutex<Option<CancellationToken>>,
}

impl IdGenerator {
    pub fn new(path: impl Into<PathBuf>, flush_interval: Duration) -> Self {
        Self {
            path: path.into(),
            flush_interval,
            counter: Mutex::new(0),
            flush_due: Arc::new(AtomicBool::new(false)),
            io: Mutex::new(()),
            ticker: Mutex::new(None),
        }
    }

    /// Load the last checkpoint (creating it at 0 if absent) and start the
    /// checkpoint timer. Must be called inside a tokio runtime.
    pub fn start(&self) -> AppResult<()> {
        let value = match read_checkpoint(&self.path)? {
            Some(value) => value,
            None => {
                write_checkpoint(&self.path, 0)?;
                0
            }
        };
        *self.counter.lock() = value;

        let token = CancellationToken::new();
        let child = token.clone();
        let flush_due = self.flush_due.clone();
        let period = self.flush_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => flush_due.store(true, Ordering::Release),
                }
            }
        });
        if let Some(previous) = self.ticker.lock().replace(token) {
            previous.cancel();
        }

        info!(
            "ID generator started at {} (file={}, flush_interval={:?})",
            value,
            self.path.display(),
            self.flush_interval
        );
        Ok(())
    }

    /// Allocate the next ID, checkpointing if the timer fired since the last
    /// checkpoint.
    pub fn next_id(&self) -> u64 {
        let id = {
            let mut counter = self.counter.lock();
            *counter += 1;
            *counter
        };

        if self.flush_due.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.checkpoint() {
                error!("Failed to checkpoint id file={} error={}", self.path.display(), e);
            }
        }
        id
    }

    /// Last issued ID
    pub fn current(&self) -> u64 {
        *self.counter.lock()
    }

    /// Stop the timer and write a final checkpoint
    pub fn stop(&self) -> AppResult<()> {
        if let Some(token) = self.ticker.lock().take() {
            token.cancel();
        }
        self.checkpoint()?;
        info!("ID generator stopped at {}", self.current());
        Ok(())
    }

    fn checkpoint(&self) -> AppResult<()> {
        let _io = self.io.lock();
        let value = self.current();
        write_checkpoint(&self.path, value)?;
        debug!("Checkpointed id {} to {}", value, self.path.display());
        Ok(())
    }
}

impl Drop for IdGenerator {
    fn drop(&mut self) {
        if let Some(token) = self.ticker.get_mut().take() {
            token.cancel();
        }
    }
}

fn read_checkpoint(path: &Path) -> AppResult<Option<u64>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let raw: [u8; CHECKPOINT_LEN] = bytes.as_slice().try_into().map_err(|_| {
                AppError::ConfigError(format!(
                    "id file {} holds {} bytes, expected {}",
                    path.display(),
                    bytes.len(),
                    CHECKPOINT_LEN
                ))
            })?;
            Ok(Some(u64::from_le_bytes(raw)))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_checkpoint(path: &Path, value: u64) -> AppResult<()> {
    write_atomic(path, &value.to_le_bytes())
}
