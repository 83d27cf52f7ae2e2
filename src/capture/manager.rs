use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, log_enabled, trace, warn, Level};
use pcap::{Activated, Active, Capture, Packet, PacketHeader, Savefile};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::parser::PacketParser;
use crate::capture::rotation::Rotation;
use crate::id::IdGenerator;
use crate::models::config::CaptureConfig;
use crate::models::device::CaptureDevice;
use crate::models::record::NetworkRecord;
use crate::models::stats::CaptureStats;
use crate::utils::error::AppResult;

/// Read timeout so the blocking loop notices cancellation
const READ_TIMEOUT_MS: i32 = 1000;

/// A device is given up on after this many read errors in a row
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Where live records go: the record queue plus the generator stamping them
#[derive(Clone)]
pub struct LiveStream {
    pub records: mpsc::Sender<NetworkRecord>,
    pub ids: Arc<IdGenerator>,
}

/// Runs one blocking capture loop per device
pub struct CaptureManager {
    devices: Vec<CaptureDevice>,

    /// Set when packets are rotated into files
    rotation: Option<Rotation>,

    /// Receives every closed capture file
    closed_files: Option<mpsc::Sender<PathBuf>>,

    live: Option<LiveStream>,

    token: CancellationToken,

    tasks: Vec<(String, JoinHandle<CaptureStats>)>,
}

impl CaptureManager {
    /// Create a capture manager for the resolved `devices`
    pub fn new(config: &CaptureConfig, devices: Vec<String>) -> AppResult<Self> {
        let devices: Vec<CaptureDevice> = devices
            .into_iter()
            .map(|name| CaptureDevice::from_config(name, config))
            .collect();

        let rotation = if devices.iter().any(|d| d.file_output) {
            Some(Rotation::new(
                &config.output_file.pcap_dir,
                config.output_file.new_file_interval,
            )?)
        } else {
            None
        };

        Ok(Self {
            devices,
            rotation,
            closed_files: None,
            live: None,
            token: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Hand closed capture files to `tx`
    pub fn with_closed_files(mut self, tx: mpsc::Sender<PathBuf>) -> Self {
        self.closed_files = Some(tx);
        self
    }

    /// Decode, stamp and push every packet to the live record queue
    pub fn with_live_stream(mut self, live: LiveStream) -> Self {
        self.live = Some(live);
        self
    }

    pub fn rotation(&self) -> Option<&Rotation> {
        self.rotation.as_ref()
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Launch one capture task per device. A device that fails to open
    /// only ends its own task.
    pub fn start(&mut self) {
        self.start_with(open_device);
    }

    /// Like [`start`](Self::start), with `open` producing each device's
    /// packet source on its capture thread.
    pub(crate) fn start_with<T, F>(&mut self, open: F)
    where
        T: Activated + 'static,
        F: Fn(&CaptureDevice) -> AppResult<Capture<T>> + Clone + Send + 'static,
    {
        for device in &self.devices {
            let device = device.clone();
            let name = device.name.clone();
            let rotation = self.rotation.clone().filter(|_| device.file_output);
            let closed_files = self.closed_files.clone();
            let live = self.live.clone();
            let token = self.token.child_token();
            let open = open.clone();

            info!("Starting capture device={}", name);
            let handle = tokio::task::spawn_blocking(move || {
                let opened = open(&device);
                run_device(device, opened, rotation, closed_files, live, token)
            });
            self.tasks.push((name, handle));
        }
    }

    /// Cancel every device, wait for the in-progress files to be handed off,
    /// and release the queues.
    pub async fn stop(&mut self) -> Vec<(String, CaptureStats)> {
        self.token.cancel();

        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.drain(..).unzip();
        let results = join_all(handles).await;

        let mut all_stats = Vec::with_capacity(names.len());
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(stats) => {
                    info!(
                        "Capture stopped device={} packets={} bytes={} files={} errors={}",
                        name, stats.total_packets, stats.total_bytes, stats.files_rotated, stats.errors
                    );
                    all_stats.push((name, stats));
                }
                Err(e) => error!("Capture task panicked device={} error={}", name, e),
            }
        }

        self.closed_files = None;
        self.live = None;
        all_stats
    }
}

fn open_device(device: &CaptureDevice) -> AppResult<Capture<Active>> {
    let capture = Capture::from_device(device.name.as_str())?
        .promisc(device.promiscuous)
        .snaplen(device.snapshot_len)
        .timeout(READ_TIMEOUT_MS)
        .open()?;
    Ok(capture)
}

/// Blocking capture loop for one device
fn run_device<T: Activated>(
    device: CaptureDevice,
    opened: AppResult<Capture<T>>,
    rotation: Option<Rotation>,
    closed_files: Option<mpsc::Sender<PathBuf>>,
    mut live: Option<LiveStream>,
    token: CancellationToken,
) -> CaptureStats {
    let mut stats = CaptureStats::default();

    let mut capture = match opened {
        Ok(capture) => capture,
        Err(e) => {
            error!("Failed to open device={} error={}", device.name, e);
            stats.errors += 1;
            return stats;
        }
    };

    let parser = PacketParser::new(capture.get_datalink());
    let mut writer = rotation.map(|r| BucketWriter::new(&device.name, r));
    let mut consecutive_errors = 0;

    info!(
        "Capture loop started device={} linktype={:?} file_output={} live={}",
        device.name,
        capture.get_datalink(),
        writer.is_some(),
        live.is_some()
    );

    while !token.is_cancelled() {
        // The packet borrows the capture, which the writer needs to open files.
        let (header, data) = match capture.next_packet() {
            Ok(packet) => {
                consecutive_errors = 0;
                (*packet.header, packet.data.to_vec())
            }
            Err(pcap::Error::TimeoutExpired) => {
                trace!("Read timed out device={}", device.name);
                continue;
            }
            Err(pcap::Error::NoMorePackets) => {
                info!("Packet source exhausted device={}", device.name);
                break;
            }
            Err(e) => {
                stats.errors += 1;
                consecutive_errors += 1;
                error!("Error capturing packet device={} error={}", device.name, e);
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!(
                        "Too many consecutive errors ({}), stopping device={}",
                        consecutive_errors, device.name
                    );
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        stats.total_packets += 1;
        stats.total_bytes += header.len as u64;

        if let Some(writer) = writer.as_mut() {
            if let Some(closed) = writer.write(&capture, &header, &data) {
                hand_off(closed, closed_files.as_ref(), &mut stats);
            }
        }

        let mut live_closed = false;
        if let Some(stream) = live.as_ref() {
            match parser.parse_packet(&header, &data) {
                Ok(decoded) => {
                    let record = decoded.into_record(stream.ids.next_id(), &device.name);
                    live_closed = stream.records.blocking_send(record).is_err();
                }
                Err(e) => {
                    stats.errors += 1;
                    debug!("Skipping undecodable packet device={} error={}", device.name, e);
                }
            }
        }
        if live_closed {
            warn!("Live record queue closed, device={} stops streaming", device.name);
            live = None;
        }
    }

    if let Some(closed) = writer.as_mut().and_then(BucketWriter::close) {
        hand_off(closed, closed_files.as_ref(), &mut stats);
    }

    info!("Capture loop stopped device={}", device.name);
    stats
}

fn hand_off(path: PathBuf, closed_files: Option<&mpsc::Sender<PathBuf>>, stats: &mut CaptureStats) {
    stats.files_rotated += 1;
    let Some(tx) = closed_files else {
        debug!("Closed capture file {}", path.display());
        return;
    };
    info!("Handing off capture file {}", path.display());
    if let Err(e) = tx.blocking_send(path) {
        error!("Upload queue closed, file={} left for the next sweep", e.0.display());
    }
}

/// Capture timestamp of a packet, falling back to now if unrepresentable
fn packet_time(header: &PacketHeader) -> DateTime<Utc> {
    DateTime::from_timestamp(
        header.ts.tv_sec as i64,
        (header.ts.tv_usec as u32).saturating_mul(1000),
    )
    .unwrap_or_else(Utc::now)
}

struct OpenBucket {
    path: PathBuf,
    /// `None` when the file could not be created; the bucket is skipped
    savefile: Option<Savefile>,
}

/// Writes packets of one device into the bucket file of their timestamp
pub(crate) struct BucketWriter {
    device: String,
    rotation: Rotation,
    current: Option<OpenBucket>,
}

impl BucketWriter {
    pub(crate) fn new(device: &str, rotation: Rotation) -> Self {
        Self {
            device: device.to_string(),
            rotation,
            current: None,
        }
    }

    /// Write one packet. Returns the previous file when the packet starts a
    /// new bucket.
    pub(crate) fn write<T: Activated + ?Sized>(
        &mut self,
        capture: &Capture<T>,
        header: &PacketHeader,
        data: &[u8],
    ) -> Option<PathBuf> {
        let path = self.rotation.file_path(&self.device, packet_time(header));

        let mut closed = None;
        if self.current.as_ref().map(|b| &b.path) != Some(&path) {
            closed = self.close();
            self.current = Some(self.open(capture, path));
        }

        if let Some(savefile) = self.current.as_mut().and_then(|b| b.savefile.as_mut()) {
            savefile.write(&Packet::new(header, data));
            if log_enabled!(Level::Trace) {
                trace!("Wrote {} bytes device={}", data.len(), self.device);
            }
        }
        closed
    }

    /// Flush and close the open bucket, returning its path if it was written
    pub(crate) fn close(&mut self) -> Option<PathBuf> {
        let bucket = self.current.take()?;
        let mut savefile = bucket.savefile?;
        if let Err(e) = savefile.flush() {
            error!("Failed to flush file={} error={}", bucket.path.display(), e);
        }
        drop(savefile);
        Some(bucket.path)
    }

    fn open<T: Activated + ?Sized>(&self, capture: &Capture<T>, path: PathBuf) -> OpenBucket {
        // Restarting inside a bucket appends, keeping cursor positions valid.
        let result = if path.exists() {
            capture.savefile_append(&path)
        } else {
            capture.savefile(&path)
        };

        match result {
            Ok(savefile) => {
                info!("Opened capture file {} device={}", path.display(), self.device);
                OpenBucket {
                    path,
                    savefile: Some(savefile),
                }
            }
            Err(e) => {
                error!(
                    "Failed to create capture file={} device={} error={}",
                    path.display(),
                    self.device,
                    e
                );
                OpenBucket {
                    path,
                    savefile: None,
                }
            }
        }
    }
}
