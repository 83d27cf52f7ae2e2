//! Durable per-file upload progress.
//!
//! Each capture file has a running count of records already forwarded and a
//! completed flag. The counts are positions in the file: on restart the
//! uploader skips that many packets from the front.

pub mod file;
pub mod sqlite;

use std::sync::Arc;

use crate::models::config::CursorConfig;
use crate::utils::error::AppResult;

pub use file::FileCursor;
pub use sqlite::SqliteCursor;

/// Upload progress keyed by bare capture file name
pub trait CursorStore: Send + Sync {
    /// One more record of `file` has been forwarded
    fn record_uploaded(&self, file: &str) -> AppResult<()>;

    /// Every record of `file` has been forwarded. Idempotent.
    fn mark_completed(&self, file: &str) -> AppResult<()>;

    fn is_completed(&self, file: &str) -> AppResult<bool>;

    /// Records of `file` forwarded so far, as the next start will see it
    fn uploaded_count(&self, file: &str) -> AppResult<i64>;

    /// Persist anything pending and stop background work
    fn close(&self) -> AppResult<()>;
}

/// Open the configured backend. The file backend's flush timer needs a
/// running tokio runtime.
pub fn build_cursor(config: &CursorConfig) -> AppResult<Arc<dyn CursorStore>> {
    match config {
        CursorConfig::File {
            file,
            flush_interval,
        } => {
            let cursor = Arc::new(FileCursor::open(file)?);
            cursor.start_flusher(*flush_interval);
            Ok(cursor)
        }
        CursorConfig::Sqlite { db_file } => Ok(Arc::new(SqliteCursor::open(db_file)?)),
    }
}
