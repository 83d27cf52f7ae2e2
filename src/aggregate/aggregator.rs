use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregate::sink::{AggregateSink, FlowRow};
use crate::aggregate::window::Windows;
use crate::models::config::SizeRecordConfig;
use crate::models::record::{Event, NetworkRecord};
use crate::models::stats::{AggregatorCounters, AggregatorStats};
use crate::utils::error::AppResult;

/// Pause between attempts of a failed batch write
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// (device, src_ip, dst_ip)
type FlowKey = (String, String, String);

/// Accumulating totals of one flow in one window
#[derive(Debug, Clone, Copy, Default)]
struct FlowTotals {
    packet_size: i64,
    packet_count: i64,
}

/// Sums packet sizes and counts per flow and window, and writes each window
/// once it is older than the late-data timeout.
pub struct Aggregator {
    windows: Windows,
    interval: Duration,
    /// Seconds a window stays open for late records
    timeout: i64,
    retry_times: u32,
    buckets: Mutex<BTreeMap<i64, HashMap<FlowKey, FlowTotals>>>,
    sink: AggregateSink,
    counters: AggregatorCounters,
    ticker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Aggregator {
    /// Build an aggregator whose windows start now
    pub fn new(config: &SizeRecordConfig) -> AppResult<Self> {
        let sink = AggregateSink::from_config(&config.sink)?;
        Ok(Self::with_start_time(config, sink, Utc::now().timestamp()))
    }

    pub fn with_start_time(config: &SizeRecordConfig, sink: AggregateSink, start_time: i64) -> Self {
        info!(
            "Aggregator started at {} (interval={:?}, timeout={:?}, retry_times={}, sink={})",
            start_time,
            config.interval,
            config.timeout,
            config.retry_times,
            sink.name()
        );
        Self {
            windows: Windows::new(start_time, config.interval.as_secs() as i64),
            interval: config.interval,
            timeout: config.timeout.as_secs() as i64,
            retry_times: config.retry_times,
            buckets: Mutex::new(BTreeMap::new()),
            sink,
            counters: AggregatorCounters::default(),
            ticker: Mutex::new(None),
        }
    }

    /// Flush eligible windows every interval until [`Aggregator::shutdown`]
    pub fn start(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let child = token.clone();
        let aggregator = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregator.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        aggregator.flush_eligible_windows().await;
                    }
                }
            }
        });
        if let Some((previous, _)) = self.ticker.lock().replace((token, handle)) {
            previous.cancel();
        }
    }

    /// Decode an event map and ingest it; malformed events are dropped
    pub fn emit(&self, event: &Event) {
        match NetworkRecord::try_from(event) {
            Ok(record) => {
                self.ingest(&record);
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                error!("Dropping malformed event error={}", e);
            }
        }
    }

    pub fn ingest(&self, record: &NetworkRecord) -> bool {
        self.ingest_at(record, Utc::now().timestamp())
    }

    /// Accumulate `record` as of wall clock `now`. Returns whether it was
    /// accepted.
    pub fn ingest_at(&self, record: &NetworkRecord, now: i64) -> bool {
        let (src, dst) = match (record.src_ip, record.dst_ip) {
            (Some(src), Some(dst)) => (src.to_string(), dst.to_string()),
            (None, None) => {
                debug!("Record {} has no addresses", record.id);
                return self.reject();
            }
            (src, dst) => {
                warn!(
                    "Record {} has only one address src={:?} dst={:?}",
                    record.id, src, dst
                );
                return self.reject();
            }
        };

        let created = record.create_time.timestamp();
        if created < now - self.timeout {
            warn!(
                "Record {} is outdated create_time={} now={} device={}",
                record.id, created, now, record.device
            );
            return self.reject();
        }

        let idx = self.windows.period_index(created);
        let mut buckets = self.buckets.lock();
        let totals = buckets
            .entry(idx)
            .or_default()
            .entry((record.device.clone(), src, dst))
            .or_default();
        totals.packet_size += record.size as i64;
        totals.packet_count += 1;
        drop(buckets);

        self.counters.ingested.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn reject(&self) -> bool {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        false
    }

    pub async fn flush_eligible_windows(&self) -> usize {
        self.flush_eligible_at(Utc::now().timestamp()).await
    }

    /// Remove every window at or before the one containing `now - timeout`
    /// and write them as one batch. Returns the rows written.
    pub async fn flush_eligible_at(&self, now: i64) -> usize {
        let threshold = self.windows.period_index(now - self.timeout);
        let eligible = {
            let mut buckets = self.buckets.lock();
            let open = buckets.split_off(&(threshold + 1));
            std::mem::replace(&mut *buckets, open)
        };

        let rows = self.rows(eligible, now);
        if rows.is_empty() {
            return 0;
        }
        debug!("Flushing {} row(s) up to window {}", rows.len(), threshold);
        if self.write_with_retry(&rows, self.retry_times).await {
            rows.len()
        } else {
            0
        }
    }

    /// Stop the timer and write everything still buffered in one attempt
    pub async fn shutdown(&self) {
        let ticker = self.ticker.lock().take();
        if let Some((token, handle)) = ticker {
            token.cancel();
            if let Err(e) = handle.await {
                error!("Aggregator ticker panicked: {}", e);
            }
        }

        let remaining = std::mem::take(&mut *self.buckets.lock());
        let rows = self.rows(remaining, Utc::now().timestamp());
        if !rows.is_empty() {
            info!("Flushing {} remaining row(s) on shutdown", rows.len());
            self.write_with_retry(&rows, 0).await;
        }

        let stats = self.stats();
        info!(
            "Aggregator stopped ingested={} rejected={} flushed_rows={} dropped_batches={}",
            stats.ingested, stats.rejected, stats.flushed_rows, stats.dropped_batches
        );
    }

    pub fn stats(&self) -> AggregatorStats {
        self.counters.snapshot()
    }

    /// Windows buffered and not yet flushed
    pub fn pending_windows(&self) -> usize {
        self.buckets.lock().len()
    }

    fn rows(&self, buckets: BTreeMap<i64, HashMap<FlowKey, FlowTotals>>, now: i64) -> Vec<FlowRow> {
        let mut rows = Vec::new();
        for (idx, flows) in buckets {
            for ((device, src_ip, dst_ip), totals) in flows {
                rows.push(FlowRow {
                    device,
                    start_time: self.windows.start_of(idx),
                    end_time: self.windows.end_of(idx),
                    src_ip,
                    dst_ip,
                    packet_size: totals.packet_size,
                    packet_count: totals.packet_count,
                    create_time: now,
                });
            }
        }
        rows
    }

    /// One attempt plus up to `retries` more. A batch that never succeeds
    /// is dropped.
    async fn write_with_retry(&self, rows: &[FlowRow], retries: u32) -> bool {
        for attempt in 0..=retries {
            match self.sink.write(rows).await {
                Ok(()) => {
                    self.counters
                        .flushed_rows
                        .fetch_add(rows.len() as u64, Ordering::Relaxed);
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Batch write failed sink={} attempt={}/{} error={}",
                        self.sink.name(),
                        attempt + 1,
                        retries + 1,
                        e
                    );
                    if attempt < retries {
                        tokio::time::sleep(RETRY_PAUSE).await;
                    }
                }
            }
        }

        self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
        error!(
            "Dropping batch of {} row(s) after {} attempt(s) sink={}",
            rows.len(),
            retries + 1,
            self.sink.name()
        );
        false
    }
}
