use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::capture::devices::resolve_devices;
use crate::capture::{CaptureManager, LiveStream};
use crate::cursor::{build_cursor, CursorStore};
use crate::id::IdGenerator;
use crate::models::config::{AppConfig, CaptureOutput, UploadSource};
use crate::models::record::{Event, NetworkRecord};
use crate::upload::UploadCoordinator;
use crate::utils::error::AppResult;

/// How the upload side is fed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Closed files from the capturer plus the startup sweep
    FileWithCapture,
    /// Only the startup sweep
    FileWithoutCapture,
    /// Records straight from the capturer
    LivePacket,
    /// Capture only writes files; nothing is uploaded
    CaptureOnly,
}

struct Stages {
    capture: Option<CaptureManager>,
    upload: Option<UploadCoordinator>,
    cursor: Option<Arc<dyn CursorStore>>,
}

/// The capture/upload side of the pipeline, exposed as a stream of events
pub struct PacketInput {
    mode: InputMode,
    records: Mutex<mpsc::Receiver<NetworkRecord>>,
    stages: Mutex<Stages>,
    ids: Arc<IdGenerator>,
}

impl PacketInput {
    /// Wire up and start the capture and upload stages described by
    /// `config`. Must be called inside a tokio runtime.
    pub fn build(config: &AppConfig) -> AppResult<Self> {
        let ids = Arc::new(IdGenerator::new(
            &config.handler.id_file,
            config.handler.flush_interval,
        ));
        ids.start()?;

        let (record_tx, record_rx) = mpsc::channel(config.handler.record_channel_size);

        let mut capture = if config.capture.enabled {
            let devices = resolve_devices(config.capture.device_mode, &config.capture.devices)?;
            Some(CaptureManager::new(&config.capture, devices)?)
        } else {
            None
        };

        let mut cursor = None;
        let mut upload = None;
        let mode = if config.upload.enabled {
            let store = build_cursor(&config.upload.cursor)?;
            let mut coordinator = UploadCoordinator::new(
                store.clone(),
                ids.clone(),
                record_tx.clone(),
                config.handler.channel_size,
            );
            cursor = Some(store);

            let mode = match (config.upload.source, capture.take()) {
                (UploadSource::File, Some(manager)) => {
                    let (handoff_tx, handoff_rx) = mpsc::channel(config.handler.channel_size);
                    let manager = manager.with_closed_files(handoff_tx);
                    coordinator.start_files(
                        &config.upload.pcap_dir,
                        Some(handoff_rx),
                        manager.rotation(),
                    )?;
                    capture = Some(manager);
                    InputMode::FileWithCapture
                }
                (UploadSource::File, None) => {
                    coordinator.start_files(&config.upload.pcap_dir, None, None)?;
                    InputMode::FileWithoutCapture
                }
                (UploadSource::LivePacket, Some(manager)) => {
                    let (live_tx, live_rx) = mpsc::channel(config.handler.record_channel_size);
                    capture = Some(manager.with_live_stream(LiveStream {
                        records: live_tx,
                        ids: ids.clone(),
                    }));
                    coordinator.start_live(live_rx);
                    InputMode::LivePacket
                }
                (UploadSource::LivePacket, None) => {
                    // Rejected by config validation.
                    warn!("Live packet upload without capture produces no records");
                    InputMode::CaptureOnly
                }
            };
            upload = Some(coordinator);
            mode
        } else if config.capture.output == CaptureOutput::Live {
            capture = capture.map(|manager| {
                manager.with_live_stream(LiveStream {
                    records: record_tx.clone(),
                    ids: ids.clone(),
                })
            });
            InputMode::LivePacket
        } else {
            InputMode::CaptureOnly
        };

        // Only the stages keep the record queue open from here on.
        drop(record_tx);

        if let Some(manager) = capture.as_mut() {
            manager.start();
        }

        info!("Packet input started mode={:?}", mode);
        Ok(Self {
            mode,
            records: Mutex::new(record_rx),
            stages: Mutex::new(Stages {
                capture,
                upload,
                cursor,
            }),
            ids,
        })
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    /// Next record as an event map; `None` once every producer has stopped
    pub async fn read_one_event(&self) -> Option<Event> {
        let record = self.records.lock().await.recv().await?;
        Some(record.to_event())
    }

    /// Stop capture, then upload, then persist the cursor and the ID
    /// counter. Records still queued stay readable until the queue closes,
    /// so keep reading while this runs.
    pub async fn shutdown(&self) {
        let mut stages = self.stages.lock().await;

        if let Some(capture) = stages.capture.as_mut() {
            info!("Stopping capture");
            capture.stop().await;
        }

        if let Some(upload) = stages.upload.as_mut() {
            let halt = self.mode == InputMode::FileWithoutCapture;
            info!("Stopping upload (halt={})", halt);
            upload.shutdown(halt).await;
        }

        if let Some(cursor) = stages.cursor.take() {
            if let Err(e) = cursor.close() {
                error!("Failed to close cursor store error={}", e);
            }
        }

        if let Err(e) = self.ids.stop() {
            error!("Failed to stop id generator error={}", e);
        }
        info!("Packet input stopped");
    }
}
