use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Error from pcap library
    #[error("PCAP error: {0}")]
    PcapError(#[from] pcap::Error),

    /// Error from I/O operations
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error from JSON serialization/deserialization
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Error from the sqlite cursor or aggregate table
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// Error talking to an HTTP sink
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Error extracting layered configuration
    #[error("Config source error: {0}")]
    FigmentError(#[from] figment::Error),

    /// Invalid or inconsistent configuration
    #[error("Config error: {0}")]
    ConfigError(String),

    /// Error from packet parsing
    #[error("Packet parsing error: {0}")]
    PacketParsingError(String),

    /// Error from capture operations
    #[error("Capture error: {0}")]
    CaptureError(String),

    /// Error reading or writing upload progress
    #[error("Cursor error: {0}")]
    CursorError(String),

    /// Error persisting aggregate rows
    #[error("Sink error: {0}")]
    SinkError(String),
}

/// Result type for application
pub type AppResult<T> = Result<T, AppError>;
