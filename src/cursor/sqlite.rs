use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::cursor::CursorStore;
use crate::utils::error::AppResult;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS upload_progress (
    file           TEXT    NOT NULL PRIMARY KEY,
    completed      INTEGER NOT NULL DEFAULT 0,
    finished_count INTEGER NOT NULL DEFAULT 0
)";

/// Progress stored as one row per capture file. Every update is its own
/// statement, so it is durable as soon as the call returns.
pub struct SqliteCursor {
    conn: Mutex<Connection>,
}

impl SqliteCursor {
    pub fn open(db_file: impl AsRef<Path>) -> AppResult<Self> {
        let conn = Connection::open(db_file.as_ref())?;
        conn.execute(CREATE_TABLE, [])?;
        info!("Opened sqlite cursor {}", db_file.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CursorStore for SqliteCursor {
    fn record_uploaded(&self, file: &str) -> AppResult<()> {
        self.conn.lock().execute(
            "INSERT INTO upload_progress (file, completed, finished_count) VALUES (?1, 0, 1)
             ON CONFLICT(file) DO UPDATE SET finished_count = finished_count + 1",
            params![file],
        )?;
        Ok(())
    }

    fn mark_completed(&self, file: &str) -> AppResult<()> {
        self.conn.lock().execute(
            "INSERT INTO upload_progress (file, completed, finished_count) VALUES (?1, 1, 0)
             ON CONFLICT(file) DO UPDATE SET completed = 1",
            params![file],
        )?;
        Ok(())
    }

    fn is_completed(&self, file: &str) -> AppResult<bool> {
        let completed = self
            .conn
            .lock()
            .query_row(
                "SELECT completed FROM upload_progress WHERE file = ?1",
                params![file],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(completed.unwrap_or(false))
    }

    fn uploaded_count(&self, file: &str) -> AppResult<i64> {
        let count = self
            .conn
            .lock()
            .query_row(
                "SELECT finished_count FROM upload_progress WHERE file = ?1",
                params![file],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    fn close(&self) -> AppResult<()> {
        Ok(())
    }
}
