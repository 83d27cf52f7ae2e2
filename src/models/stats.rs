use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-device capture counters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CaptureStats {
    /// Total number of packets captured
    pub total_packets: u64,

    /// Total bytes captured (wire length)
    pub total_bytes: u64,

    /// Capture files closed and handed off
    pub files_rotated: u64,

    /// Errors encountered during capture
    pub errors: u64,
}

/// Snapshot of aggregator counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Records accumulated into a window
    pub ingested: u64,

    /// Records rejected by validation
    pub rejected: u64,

    /// Rows written to the sink
    pub flushed_rows: u64,

    /// Batches given up on after exhausting retries
    pub dropped_batches: u64,
}

/// Live counters behind [`AggregatorStats`]
#[derive(Debug, Default)]
pub struct AggregatorCounters {
    pub ingested: AtomicU64,
    pub rejected: AtomicU64,
    pub flushed_rows: AtomicU64,
    pub dropped_batches: AtomicU64,
}

impl AggregatorCounters {
    pub fn snapshot(&self) -> AggregatorStats {
        AggregatorStats {
            ingested: self.ingested.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            flushed_rows: self.flushed_rows.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
        }
    }
}
