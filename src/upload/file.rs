use chrono::Utc;
use log::{debug, error, info, warn};
use pcap::Capture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capture::parser::PacketParser;
use crate::capture::rotation::{bucket_from_file_name, device_from_file_name, is_capture_file, Rotation};
use crate::cursor::CursorStore;
use crate::id::IdGenerator;
use crate::models::record::NetworkRecord;
use crate::utils::error::{AppError, AppResult};

/// Outcome of one call to [`FileUploader::upload_file`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub file: String,
    /// Packets skipped because the cursor already had them
    pub skipped: u64,
    /// Records emitted downstream
    pub sent: u64,
    /// Packets that failed to decode (still counted in the cursor)
    pub undecodable: u64,
    pub completed: bool,
}

/// Replays capture files into the record queue, resuming from the cursor
pub struct FileUploader {
    cursor: Arc<dyn CursorStore>,
    ids: Arc<IdGenerator>,
    records: mpsc::Sender<NetworkRecord>,
}

impl FileUploader {
    pub fn new(
        cursor: Arc<dyn CursorStore>,
        ids: Arc<IdGenerator>,
        records: mpsc::Sender<NetworkRecord>,
    ) -> Self {
        Self {
            cursor,
            ids,
            records,
        }
    }

    /// Upload the records of `path` the cursor has not seen yet.
    ///
    /// Blocking: reads the file with libpcap and waits on the record queue.
    /// Stops before the next record once `halt` is cancelled, leaving the
    /// file incomplete.
    pub fn upload_file(&self, path: &Path, halt: &CancellationToken) -> AppResult<UploadSummary> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AppError::CaptureError(format!("bad file name {}", path.display())))?;
        let device = device_from_file_name(name).ok_or_else(|| {
            AppError::CaptureError(format!("cannot tell device from file name {}", name))
        })?;

        let mut summary = UploadSummary {
            file: name.to_string(),
            skipped: 0,
            sent: 0,
            undecodable: 0,
            completed: false,
        };

        if self.cursor.is_completed(name)? {
            debug!("Already uploaded file={}", name);
            summary.completed = true;
            return Ok(summary);
        }
        let resume_at = self.cursor.uploaded_count(name)?.max(0) as u64;

        let mut capture = Capture::from_file(path)?;
        let parser = PacketParser::new(capture.get_datalink());
        let mut position: u64 = 0;

        info!("Uploading file={} device={} from position {}", name, device, resume_at);

        loop {
            if halt.is_cancelled() {
                info!("Upload halted file={} at position {}", name, position);
                return Ok(summary);
            }

            let decoded = match capture.next_packet() {
                Ok(packet) => parser.parse_packet(packet.header, packet.data),
                Err(pcap::Error::NoMorePackets) => break,
                Err(e) => {
                    warn!("Read error ends file={} at position {} error={}", name, position, e);
                    break;
                }
            };
            position += 1;

            if position <= resume_at {
                summary.skipped += 1;
                continue;
            }

            match decoded {
                Ok(decoded) => {
                    let record = decoded.into_record(self.ids.next_id(), device);
                    if self.records.blocking_send(record).is_err() {
                        return Err(AppError::CaptureError(format!(
                            "record queue closed while uploading {}",
                            name
                        )));
                    }
                    summary.sent += 1;
                }
                Err(e) => {
                    summary.undecodable += 1;
                    debug!("Skipping undecodable packet file={} position={} error={}", name, position, e);
                }
            }

            if let Err(e) = self.cursor.record_uploaded(name) {
                error!("Failed to record progress file={} error={}", name, e);
            }
        }

        if let Err(e) = self.cursor.mark_completed(name) {
            error!("Failed to mark completed file={} error={}", name, e);
        }
        summary.completed = true;

        info!(
            "Uploaded file={} positions {}..{} sent={} undecodable={}",
            name,
            resume_at + 1,
            position,
            summary.sent,
            summary.undecodable
        );
        Ok(summary)
    }
}

/// Capture files in `dir` not yet completed, ordered by device and then by
/// bucket start. Names that do not parse as bucket files sort last by name.
///
/// With `open_bucket` set, files of the bucket currently being written are
/// left out; the capturer hands them off when it rotates.
pub fn sweep(
    dir: &Path,
    cursor: &dyn CursorStore,
    open_bucket: Option<&Rotation>,
) -> AppResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        warn!("Capture directory {} does not exist, nothing to sweep", dir.display());
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_capture_file(name) {
            continue;
        }

        if let (Some(rotation), Some(device)) = (open_bucket, device_from_file_name(name)) {
            if rotation.file_name(device, now) == name {
                debug!("Skipping open bucket file={}", name);
                continue;
            }
        }

        match cursor.is_completed(name) {
            Ok(true) => continue,
            Ok(false) => {}
            // Queued anyway; the upload reports the cursor error for this file.
            Err(e) => warn!("Cursor lookup failed file={} error={}", name, e),
        }
        files.push(path);
    }

    files.sort_by_cached_key(|path| {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let bucket = bucket_from_file_name(name).map(|(device, start)| (device.to_string(), start));
        (bucket.is_none(), bucket, name.to_string())
    });
    info!("Sweep found {} capture file(s) to upload in {}", files.len(), dir.display());
    Ok(files)
}
