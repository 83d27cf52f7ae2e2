use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::models::config::SinkConfig;
use crate::utils::error::{AppError, AppResult};

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// One aggregate row: traffic of one flow within one window.
///
/// `end_time` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRow {
    pub device: String,
    pub start_time: i64,
    pub end_time: i64,
    pub src_ip: String,
    pub dst_ip: String,
    pub packet_size: i64,
    pub packet_count: i64,
    /// When the row was flushed
    pub create_time: i64,
}

/// Destination of flushed windows
pub enum AggregateSink {
    ClickHouse(ClickHouseSink),
    Sqlite(SqliteSink),
    Stdout,
}

impl AggregateSink {
    pub fn from_config(config: &SinkConfig) -> AppResult<Self> {
        match config {
            SinkConfig::ClickHouse {
                url,
                database,
                table,
                username,
                password,
            } => Ok(AggregateSink::ClickHouse(ClickHouseSink::new(
                url, database, table, username, password,
            )?)),
            SinkConfig::Sqlite { db_file, table } => {
                Ok(AggregateSink::Sqlite(SqliteSink::open(db_file, table)?))
            }
            SinkConfig::Stdout => Ok(AggregateSink::Stdout),
        }
    }

    /// Write one batch; all rows or an error
    pub async fn write(&self, rows: &[FlowRow]) -> AppResult<()> {
        match self {
            AggregateSink::ClickHouse(sink) => sink.write(rows).await,
            AggregateSink::Sqlite(sink) => sink.write(rows).await,
            AggregateSink::Stdout => {
                for row in rows {
                    println!("{}", serde_json::to_string(row)?);
                }
                Ok(())
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateSink::ClickHouse(_) => "clickhouse",
            AggregateSink::Sqlite(_) => "sqlite",
            AggregateSink::Stdout => "stdout",
        }
    }
}

/// Table names are spliced into SQL, so only plain identifiers are allowed
fn check_identifier(kind: &str, name: &str) -> AppResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(AppError::ConfigError(format!("invalid {} name: {:?}", kind, name)));
    }
    Ok(())
}

/// Inserts over the ClickHouse HTTP interface as `JSONEachRow`
pub struct ClickHouseSink {
    client: reqwest::Client,
    url: String,
    query: String,
    username: String,
    password: String,
}

impl ClickHouseSink {
    pub fn new(
        url: &str,
        database: &str,
        table: &str,
        username: &str,
        password: &str,
    ) -> AppResult<Self> {
        check_identifier("database", database)?;
        check_identifier("table", table)?;
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        info!("ClickHouse sink {} -> {}.{}", url, database, table);
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            query: format!("INSERT INTO {}.{} FORMAT JSONEachRow", database, table),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    async fn write(&self, rows: &[FlowRow]) -> AppResult<()> {
        let mut body = String::new();
        for row in rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }

        let mut request = self
            .client
            .post(format!("{}/", self.url))
            .query(&[("query", self.query.as_str())])
            .body(body);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::SinkError(format!(
                "clickhouse returned {}: {}",
                status,
                text.trim()
            )));
        }
        debug!("ClickHouse accepted {} row(s)", rows.len());
        Ok(())
    }
}

/// Appends rows to a local sqlite table, one transaction per batch
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
    insert: String,
}

impl SqliteSink {
    pub fn open(db_file: &Path, table: &str) -> AppResult<Self> {
        check_identifier("table", table)?;
        let conn = Connection::open(db_file)?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    device       TEXT    NOT NULL,
                    start_time   INTEGER NOT NULL,
                    end_time     INTEGER NOT NULL,
                    src_ip       TEXT    NOT NULL,
                    dst_ip       TEXT    NOT NULL,
                    packet_size  INTEGER NOT NULL,
                    packet_count INTEGER NOT NULL,
                    create_time  INTEGER NOT NULL
                )",
                table
            ),
            [],
        )?;
        info!("Sqlite sink {} table {}", db_file.display(), table);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            insert: format!(
                "INSERT INTO {} (device, start_time, end_time, src_ip, dst_ip, packet_size, packet_count, create_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                table
            ),
        })
    }

    async fn write(&self, rows: &[FlowRow]) -> AppResult<()> {
        let conn = self.conn.clone();
        let insert = self.insert.clone();
        let rows = rows.to_vec();

        tokio::task::spawn_blocking(move || -> AppResult<()> {
            let mut conn = conn.lock();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&insert)?;
                for row in &rows {
                    stmt.execute(params![
                        row.device,
                        row.start_time,
                        row.end_time,
                        row.src_ip,
                        row.dst_ip,
                        row.packet_size,
                        row.packet_count,
                        row.create_time
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::SinkError(format!("sqlite writer failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(device: &str, size: i64) -> FlowRow {
        FlowRow {
            device: device.to_string(),
            start_time: 100,
            end_time: 160,
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            packet_size: size,
            packet_count: 1,
            create_time: 200,
        }
    }

    #[test]
    fn rejects_unsafe_table_names() {
        assert!(check_identifier("table", "interval_traffic").is_ok());
        assert!(check_identifier("table", "t; DROP TABLE x").is_err());
        assert!(check_identifier("table", "").is_err());
        assert!(check_identifier("table", "1abc").is_err());
    }

    #[tokio::test]
    async fn sqlite_sink_appends_batches() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("agg.db");
        let sink = AggregateSink::from_config(&SinkConfig::Sqlite {
            db_file: db.clone(),
            table: "interval_traffic".to_string(),
        })
        .unwrap();

        sink.write(&[row("eth0", 60), row("lo", 40)]).await.unwrap();
        sink.write(&[row("eth0", 100)]).await.unwrap();

        let conn = Connection::open(&db).unwrap();
        let (count, total): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), SUM(packet_size) FROM interval_traffic",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(total, 200);
    }

    #[test]
    fn row_serializes_with_column_names() {
        let json = serde_json::to_value(row("eth0", 60)).unwrap();
        assert_eq!(json["packet_size"], 60);
        assert_eq!(json["start_time"], 100);
        assert_eq!(json["src_ip"], "10.0.0.1");
    }
}
