//! Upload coordinator: turns closed capture files (or live packets) into the
//! normalized record stream.

pub mod file;

use futures::future::{join_all, select_all};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::SendError, error::TrySendError, OwnedPermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::rotation::{device_from_file_name, Rotation};
use crate::cursor::CursorStore;
use crate::id::IdGenerator;
use crate::models::record::NetworkRecord;
use crate::utils::error::AppResult;

pub use file::{sweep, FileUploader, UploadSummary};

/// Feeds the record queue from one of the three upload sources
pub struct UploadCoordinator {
    cursor: Arc<dyn CursorStore>,
    ids: Arc<IdGenerator>,

    /// Dropped once handed to the tasks, so the queue closes when they end
    records: Option<mpsc::Sender<NetworkRecord>>,

    /// Capacity of each per-device file queue
    queue_size: usize,

    /// Stop after the current record instead of draining
    halt: CancellationToken,

    tasks: Vec<JoinHandle<()>>,
}

impl UploadCoordinator {
    pub fn new(
        cursor: Arc<dyn CursorStore>,
        ids: Arc<IdGenerator>,
        records: mpsc::Sender<NetworkRecord>,
        queue_size: usize,
    ) -> Self {
        Self {
            cursor,
            ids,
            records: Some(records),
            queue_size,
            halt: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Upload the backlog in `pcap_dir`, then every file arriving on
    /// `closed_files` until it closes.
    ///
    /// Without `closed_files` only the backlog is processed and the record
    /// queue closes when it is done. `open_bucket` keeps the sweep away from
    /// files the capturer is still writing.
    pub fn start_files(
        &mut self,
        pcap_dir: &Path,
        closed_files: Option<mpsc::Receiver<PathBuf>>,
        open_bucket: Option<&Rotation>,
    ) -> AppResult<()> {
        let backlog = sweep(pcap_dir, self.cursor.as_ref(), open_bucket)?;
        let Some(records) = self.records.take() else {
            warn!("Upload coordinator already started");
            return Ok(());
        };

        let uploader = Arc::new(FileUploader::new(
            self.cursor.clone(),
            self.ids.clone(),
            records,
        ));
        let dispatcher = Dispatcher {
            uploader,
            queue_size: self.queue_size,
            halt: self.halt.clone(),
            workers: HashMap::new(),
            pending: HashMap::new(),
        };

        info!(
            "Upload started: {} backlog file(s), live handoff={}",
            backlog.len(),
            closed_files.is_some()
        );
        self.tasks
            .push(tokio::spawn(dispatcher.run(backlog, closed_files)));
        Ok(())
    }

    /// Forward records from the capturer's live queue unchanged
    pub fn start_live(&mut self, mut live: mpsc::Receiver<NetworkRecord>) {
        let Some(records) = self.records.take() else {
            warn!("Upload coordinator already started");
            return;
        };
        let halt = self.halt.clone();

        info!("Upload started from live packets");
        self.tasks.push(tokio::spawn(async move {
            let mut forwarded: u64 = 0;
            loop {
                let record = tokio::select! {
                    _ = halt.cancelled() => break,
                    record = live.recv() => match record {
                        Some(record) => record,
                        None => break,
                    },
                };
                if records.send(record).await.is_err() {
                    warn!("Record queue closed, live forwarding stops");
                    break;
                }
                forwarded += 1;
            }
            info!("Live forwarding stopped after {} record(s)", forwarded);
        }));
    }

    /// Wait for the upload tasks to finish.
    ///
    /// With `halt` set, in-flight uploads stop after their current record;
    /// otherwise every queued file is drained first.
    pub async fn shutdown(&mut self, halt: bool) {
        if halt {
            self.halt.cancel();
        }
        self.records = None;

        for result in join_all(self.tasks.drain(..)).await {
            if let Err(e) = result {
                error!("Upload task panicked: {}", e);
            }
        }
        info!("Upload coordinator stopped");
    }
}

/// Routes files to one serial worker per device.
///
/// Files for a device whose queue is full wait in `pending`, so one slow
/// device never holds up the files of the others.
struct Dispatcher {
    uploader: Arc<FileUploader>,
    queue_size: usize,
    halt: CancellationToken,
    workers: HashMap<String, (mpsc::Sender<PathBuf>, JoinHandle<()>)>,
    pending: HashMap<String, VecDeque<PathBuf>>,
}

type Blocked = Vec<(String, mpsc::Sender<PathBuf>)>;

impl Dispatcher {
    async fn run(mut self, backlog: Vec<PathBuf>, mut closed_files: Option<mpsc::Receiver<PathBuf>>) {
        for path in backlog {
            if self.halt.is_cancelled() {
                break;
            }
            self.route(path);
        }

        let halt = self.halt.clone();
        loop {
            let blocked = self.blocked();
            let has_blocked = !blocked.is_empty();
            let handoff_open = closed_files.is_some();
            if !handoff_open && !has_blocked {
                break;
            }

            tokio::select! {
                _ = halt.cancelled() => break,
                path = next_closed_file(&mut closed_files), if handoff_open => match path {
                    Some(path) => self.route(path),
                    None => closed_files = None,
                },
                (device, permit) = free_slot(blocked), if has_blocked => self.deliver(device, permit),
            }
        }

        let held: usize = self.pending.values().map(VecDeque::len).sum();
        if held > 0 {
            info!("Upload halted with {} file(s) not queued; they are swept next start", held);
        }

        // Closing the per-device queues lets each worker finish what it has.
        let handles: Vec<_> = self.workers.into_values().map(|(_, handle)| handle).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Upload worker panicked: {}", e);
            }
        }
        debug!("Upload dispatcher finished");
    }

    fn route(&mut self, path: PathBuf) {
        let Some(device) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(device_from_file_name)
            .map(str::to_string)
        else {
            warn!("Ignoring file with no device in its name: {}", path.display());
            return;
        };

        let (tx, _) = self.workers.entry(device.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.queue_size);
            let handle = tokio::spawn(device_worker(
                device.clone(),
                rx,
                self.uploader.clone(),
                self.halt.clone(),
            ));
            (tx, handle)
        });

        // Files already waiting go first.
        if let Some(queue) = self.pending.get_mut(&device) {
            queue.push_back(path);
            return;
        }

        match tx.try_send(path) {
            Ok(()) => {}
            Err(TrySendError::Full(path)) => {
                debug!("Upload queue full device={}, holding {}", device, path.display());
                self.pending.entry(device).or_default().push_back(path);
            }
            Err(TrySendError::Closed(path)) => {
                debug!("Upload worker for device={} gone, dropping {}", device, path.display());
            }
        }
    }

    /// Devices with held files, paired with their queues
    fn blocked(&self) -> Blocked {
        self.pending
            .keys()
            .filter_map(|device| {
                let (tx, _) = self.workers.get(device)?;
                Some((device.clone(), tx.clone()))
            })
            .collect()
    }

    fn deliver(&mut self, device: String, permit: Result<OwnedPermit<PathBuf>, SendError<()>>) {
        let Some(queue) = self.pending.get_mut(&device) else {
            return;
        };
        match permit {
            Ok(permit) => {
                if let Some(path) = queue.pop_front() {
                    permit.send(path);
                }
                if queue.is_empty() {
                    self.pending.remove(&device);
                }
            }
            Err(_) => {
                debug!(
                    "Upload worker for device={} gone, dropping {} held file(s)",
                    device,
                    queue.len()
                );
                self.pending.remove(&device);
            }
        }
    }
}

async fn next_closed_file(closed_files: &mut Option<mpsc::Receiver<PathBuf>>) -> Option<PathBuf> {
    match closed_files {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

/// First held device whose queue has room
async fn free_slot(blocked: Blocked) -> (String, Result<OwnedPermit<PathBuf>, SendError<()>>) {
    let waits = blocked
        .into_iter()
        .map(|(device, tx)| Box::pin(async move { (device, tx.reserve_owned().await) }));
    select_all(waits).await.0
}

/// Uploads one device's files strictly in arrival order
async fn device_worker(
    device: String,
    mut files: mpsc::Receiver<PathBuf>,
    uploader: Arc<FileUploader>,
    halt: CancellationToken,
) {
    debug!("Upload worker started device={}", device);
    while let Some(path) = files.recv().await {
        if halt.is_cancelled() {
            break;
        }

        let uploader = uploader.clone();
        let halt = halt.clone();
        let display = path.display().to_string();
        let result =
            tokio::task::spawn_blocking(move || uploader.upload_file(&path, &halt)).await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Upload failed file={} error={}", display, e),
            Err(e) => error!("Upload task panicked file={} error={}", display, e),
        }
    }
    debug!("Upload worker stopped device={}", device);
}

#[cfg(test)]
mod tests {
    use super::file::tests::{setup, write_capture, write_frames, udp_frame};
    use super::*;
    use std::time::Duration;

    const NOON: i64 = 1_709_294_400;

    async fn collect(mut rx: mpsc::Receiver<NetworkRecord>) -> Vec<NetworkRecord> {
        let mut out = Vec::new();
        while let Some(record) = rx.recv().await {
            out.push(record);
        }
        out
    }

    #[tokio::test]
    async fn backlog_only_mode_closes_the_stream_when_done() {
        let dir = tempfile::tempdir().unwrap();
        let pcaps = dir.path().join("pcap");
        std::fs::create_dir(&pcaps).unwrap();
        write_capture(&pcaps.join("eth0-2024-03-01-12-0.pcap"), NOON, 10);
        write_capture(&pcaps.join("eth0-2024-03-01-12-5.pcap"), NOON + 300, 7);
        write_capture(&pcaps.join("lo-2024-03-01-12-0.pcap"), NOON, 3);

        let (cursor, ids, tx, rx) = setup(dir.path(), 4);
        ids.start().unwrap();
        let mut coordinator = UploadCoordinator::new(cursor.clone(), ids, tx, 2);
        coordinator.start_files(&pcaps, None, None).unwrap();

        let records = collect(rx).await;
        coordinator.shutdown(false).await;

        assert_eq!(records.len(), 20);
        let eth0: Vec<i64> = records
            .iter()
            .filter(|r| r.device == "eth0")
            .map(|r| r.create_time.timestamp())
            .collect();
        // One worker per device keeps that device's records in file order.
        assert_eq!(eth0.len(), 17);
        assert!(eth0.windows(2).all(|w| w[0] < w[1]));

        let mut ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 20);

        assert_eq!(cursor.uploaded_count("eth0-2024-03-01-12-0.pcap").unwrap(), 10);
        assert_eq!(cursor.uploaded_count("eth0-2024-03-01-12-5.pcap").unwrap(), 7);
        assert!(cursor.is_completed("lo-2024-03-01-12-0.pcap").unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_does_not_block_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("eth0-2024-03-01-12-0.pcap"), b"garbage").unwrap();
        write_capture(&dir.path().join("eth0-2024-03-01-12-5.pcap"), NOON + 300, 4);

        let (cursor, ids, tx, rx) = setup(dir.path(), 8);
        ids.start().unwrap();
        let mut coordinator = UploadCoordinator::new(cursor.clone(), ids, tx, 4);
        coordinator.start_files(dir.path(), None, None).unwrap();

        let records = collect(rx).await;
        coordinator.shutdown(false).await;

        assert_eq!(records.len(), 4);
        assert!(!cursor.is_completed("eth0-2024-03-01-12-0.pcap").unwrap());
        assert!(cursor.is_completed("eth0-2024-03-01-12-5.pcap").unwrap());
    }

    #[tokio::test]
    async fn handed_off_files_are_uploaded_after_the_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let pcaps = dir.path().join("pcap");
        std::fs::create_dir(&pcaps).unwrap();
        write_capture(&pcaps.join("eth0-2024-03-01-12-0.pcap"), NOON, 2);

        let (cursor, ids, tx, rx) = setup(dir.path(), 8);
        ids.start().unwrap();
        let (handoff_tx, handoff_rx) = mpsc::channel(2);
        let mut coordinator = UploadCoordinator::new(cursor.clone(), ids, tx, 2);
        coordinator.start_files(&pcaps, Some(handoff_rx), None).unwrap();

        let later = pcaps.join("eth0-2024-03-01-12-5.pcap");
        let frames = vec![udp_frame([192, 168, 0, 1], [192, 168, 0, 2], 30); 3];
        write_frames(&later, NOON + 300, &frames);
        handoff_tx.send(later).await.unwrap();
        drop(handoff_tx);

        let records = collect(rx).await;
        coordinator.shutdown(false).await;

        let times: Vec<i64> = records.iter().map(|r| r.create_time.timestamp()).collect();
        assert_eq!(times, vec![NOON, NOON + 1, NOON + 300, NOON + 301, NOON + 302]);
        assert!(cursor.is_completed("eth0-2024-03-01-12-5.pcap").unwrap());
    }

    /// Holds every lookup of files whose name starts with `prefix` until
    /// the gate is released
    struct GatedCursor {
        inner: Arc<crate::cursor::FileCursor>,
        prefix: &'static str,
        gate: Arc<parking_lot::Mutex<()>>,
    }

    impl CursorStore for GatedCursor {
        fn record_uploaded(&self, file: &str) -> AppResult<()> {
            self.inner.record_uploaded(file)
        }

        fn mark_completed(&self, file: &str) -> AppResult<()> {
            self.inner.mark_completed(file)
        }

        fn is_completed(&self, file: &str) -> AppResult<bool> {
            if file.starts_with(self.prefix) {
                drop(self.gate.lock());
            }
            self.inner.is_completed(file)
        }

        fn uploaded_count(&self, file: &str) -> AppResult<i64> {
            self.inner.uploaded_count(file)
        }

        fn close(&self) -> AppResult<()> {
            self.inner.close()
        }
    }

    #[tokio::test]
    async fn busy_device_does_not_hold_up_other_devices() {
        let dir = tempfile::tempdir().unwrap();
        let swept = dir.path().join("pcap");
        std::fs::create_dir(&swept).unwrap();
        let closed = dir.path().join("closed");
        std::fs::create_dir(&closed).unwrap();
        let eth0: Vec<PathBuf> = [0, 5, 10, 15]
            .iter()
            .map(|minute| closed.join(format!("eth0-2024-03-01-12-{}.pcap", minute)))
            .collect();
        for (i, path) in eth0.iter().enumerate() {
            write_capture(path, NOON + 300 * i as i64, 1);
        }
        let lo = closed.join("lo-2024-03-01-12-0.pcap");
        write_capture(&lo, NOON, 2);

        let (file_cursor, ids, tx, mut rx) = setup(dir.path(), 8);
        ids.start().unwrap();
        let gate = Arc::new(parking_lot::Mutex::new(()));
        let cursor = Arc::new(GatedCursor {
            inner: file_cursor,
            prefix: "eth0-",
            gate: gate.clone(),
        });
        let held = gate.lock();

        let (handoff_tx, handoff_rx) = mpsc::channel(8);
        let mut coordinator = UploadCoordinator::new(cursor, ids, tx, 1);
        coordinator.start_files(&swept, Some(handoff_rx), None).unwrap();
        for path in eth0.iter().chain(std::iter::once(&lo)) {
            handoff_tx.send(path.clone()).await.unwrap();
        }

        // eth0's worker is stuck on its first file and its queue of one is full.
        for _ in 0..2 {
            let record = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.device, "lo");
        }

        drop(held);
        drop(handoff_tx);
        let rest = collect(rx).await;
        coordinator.shutdown(false).await;

        let times: Vec<i64> = rest.iter().map(|r| r.create_time.timestamp()).collect();
        assert_eq!(times, vec![NOON, NOON + 300, NOON + 600, NOON + 900]);
        assert!(rest.iter().all(|r| r.device == "eth0"));
    }

    #[tokio::test]
    async fn live_records_are_forwarded_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let (cursor, ids, tx, rx) = setup(dir.path(), 8);
        let (live_tx, live_rx) = mpsc::channel(8);
        let mut coordinator = UploadCoordinator::new(cursor, ids, tx, 2);
        coordinator.start_live(live_rx);

        let record = NetworkRecord {
            id: 42,
            device: "eth0".to_string(),
            create_time: chrono::DateTime::from_timestamp(NOON, 0).unwrap(),
            size: 60,
            src_ip: "10.0.0.1".parse().ok(),
            dst_ip: "10.0.0.2".parse().ok(),
        };
        live_tx.send(record.clone()).await.unwrap();
        drop(live_tx);

        let records = collect(rx).await;
        coordinator.shutdown(false).await;
        assert_eq!(records, vec![record]);
    }

    #[tokio::test]
    async fn halting_leaves_the_backlog_for_next_start() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(&dir.path().join("eth0-2024-03-01-12-0.pcap"), NOON, 50);

        // Queue of one: the uploader blocks on the second record until read.
        let (cursor, ids, tx, mut rx) = setup(dir.path(), 1);
        ids.start().unwrap();
        let mut coordinator = UploadCoordinator::new(cursor.clone(), ids, tx, 2);
        coordinator.start_files(dir.path(), None, None).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.create_time.timestamp(), NOON);

        coordinator.halt.cancel();
        let rest = collect(rx).await;
        coordinator.shutdown(true).await;

        assert!(rest.len() < 49);
        assert!(!cursor.is_completed("eth0-2024-03-01-12-0.pcap").unwrap());
        let acknowledged = cursor.uploaded_count("eth0-2024-03-01-12-0.pcap").unwrap();
        assert_eq!(acknowledged as usize, 1 + rest.len());
    }
}
