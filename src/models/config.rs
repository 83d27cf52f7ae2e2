use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::rotation::validate_interval;
use crate::utils::error::{AppError, AppResult};

/// Prefix for environment overrides, e.g. `FLOWSTAT_CAPTURE__PROMISCUOUS=true`.
pub const ENV_PREFIX: &str = "FLOWSTAT_";

/// Human readable durations ("5m", "30s") for serde.
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// How `capture.devices` is applied to the live interface list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    /// Capture only the named devices
    #[default]
    Allow,
    /// Capture every device except the named ones
    Deny,
}

/// Where the capturer sends packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureOutput {
    /// Rotate packets into time-bucketed pcap files
    #[default]
    File,
    /// Do not write files; packets only flow through the live queue
    Live,
}

/// Where the upload coordinator reads records from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadSource {
    #[default]
    File,
    LivePacket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFileConfig {
    /// Directory the rotated capture files are written to
    pub pcap_dir: PathBuf,

    /// Bucket length; must be whole minutes and divide one hour
    #[serde(with = "duration")]
    pub new_file_interval: Duration,
}

impl Default for OutputFileConfig {
    fn default() -> Self {
        Self {
            pcap_dir: PathBuf::from("pcap"),
            new_file_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub enabled: bool,

    pub device_mode: DeviceMode,

    /// Device names for the allow/deny list
    pub devices: Vec<String>,

    /// Snapshot length passed to libpcap
    pub snapshot_len: i32,

    /// Enable promiscuous mode
    pub promiscuous: bool,

    pub output: CaptureOutput,

    pub output_file: OutputFileConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_mode: DeviceMode::Allow,
            devices: Vec::new(),
            snapshot_len: 65535,
            promiscuous: false,
            output: CaptureOutput::File,
            output_file: OutputFileConfig::default(),
        }
    }
}

/// Settings shared by the capturer and the uploader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Capacity of the closed-file handoff queue (and each per-device queue)
    pub channel_size: usize,

    /// Capacity of the normalized record queue
    pub record_channel_size: usize,

    /// Checkpoint file of the record ID generator
    pub id_file: PathBuf,

    /// How often the ID generator checkpoints
    #[serde(with = "duration")]
    pub flush_interval: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            channel_size: 64,
            record_channel_size: 4096,
            id_file: PathBuf::from("id.bin"),
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Cursor store backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CursorConfig {
    /// JSON checkpoint file flushed on an interval
    File {
        file: PathBuf,
        #[serde(with = "duration")]
        flush_interval: Duration,
    },
    /// One row per capture file, updated per record
    Sqlite { db_file: PathBuf },
}

impl Default for CursorConfig {
    fn default() -> Self {
        CursorConfig::File {
            file: PathBuf::from("cursor.json"),
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub enabled: bool,

    pub source: UploadSource,

    /// Directory swept for capture files at startup
    pub pcap_dir: PathBuf,

    pub cursor: CursorConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: UploadSource::File,
            pcap_dir: PathBuf::from("pcap"),
            cursor: CursorConfig::default(),
        }
    }
}

/// Destination of aggregated flow rows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    /// ClickHouse HTTP interface
    #[serde(rename = "clickhouse")]
    ClickHouse {
        url: String,
        database: String,
        table: String,
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    },
    Sqlite {
        db_file: PathBuf,
        table: String,
    },
    Stdout,
}

/// Time-windowed flow aggregation output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeRecordConfig {
    /// Window length
    #[serde(with = "duration")]
    pub interval: Duration,

    /// How long a window stays open for late records
    #[serde(with = "duration")]
    pub timeout: Duration,

    /// Retries after a failed batch write
    pub retry_times: u32,

    pub sink: SinkConfig,
}

impl Default for SizeRecordConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            retry_times: 3,
            sink: SinkConfig::Stdout,
        }
    }
}

/// Output plugins, resolved once at load time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputConfig {
    SizeRecord(SizeRecordConfig),
    Stdout,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub capture: CaptureConfig,

    pub handler: HandlerConfig,

    pub upload: UploadConfig,

    pub outputs: Vec<OutputConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            handler: HandlerConfig::default(),
            upload: UploadConfig::default(),
            outputs: vec![OutputConfig::SizeRecord(SizeRecordConfig::default())],
        }
    }
}

impl AppConfig {
    /// Layer defaults, the YAML file at `path` (if present) and `FLOWSTAT_*`
    /// environment variables, then validate the result.
    pub fn load(path: &Path) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        if path.is_file() {
            info!("Loading configuration from {}", path.display());
            figment = figment.merge(Yaml::file(path));
        } else if path.exists() {
            return Err(AppError::ConfigError(format!(
                "config path {} is not a file",
                path.display()
            )));
        } else {
            warn!("Config file {} not found, using defaults", path.display());
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject every combination that cannot run
    pub fn validate(&self) -> AppResult<()> {
        if !self.capture.enabled && !self.upload.enabled {
            return Err(AppError::ConfigError(
                "enable at least one of capture and upload".to_string(),
            ));
        }

        if self.handler.channel_size == 0 || self.handler.record_channel_size == 0 {
            return Err(AppError::ConfigError(
                "handler channel sizes must be greater than zero".to_string(),
            ));
        }

        if self.handler.flush_interval.is_zero() {
            return Err(AppError::ConfigError(
                "handler.flush_interval must be greater than zero".to_string(),
            ));
        }

        if self.capture.enabled {
            if self.capture.snapshot_len <= 0 {
                return Err(AppError::ConfigError(
                    "capture.snapshot_len must be positive".to_string(),
                ));
            }
            if self.capture.output == CaptureOutput::File {
                validate_interval(self.capture.output_file.new_file_interval)?;
            }
        }

        if self.upload.enabled {
            if self.capture.enabled
                && self.upload.source == UploadSource::File
                && self.capture.output != CaptureOutput::File
            {
                return Err(AppError::ConfigError(
                    "upload.source = file requires capture.output = file".to_string(),
                ));
            }
            if self.capture.enabled
                && self.upload.source == UploadSource::File
                && self.upload.pcap_dir != self.capture.output_file.pcap_dir
            {
                return Err(AppError::ConfigError(format!(
                    "upload.pcap_dir ({}) must match capture.output_file.pcap_dir ({}) when uploading captured files",
                    self.upload.pcap_dir.display(),
                    self.capture.output_file.pcap_dir.display()
                )));
            }
            if !self.capture.enabled && self.upload.source == UploadSource::LivePacket {
                return Err(AppError::ConfigError(
                    "upload.source = live_packet requires capture to be enabled".to_string(),
                ));
            }
            if let CursorConfig::File { flush_interval, .. } = &self.upload.cursor {
                if flush_interval.is_zero() {
                    return Err(AppError::ConfigError(
                        "upload.cursor.flush_interval must be greater than zero".to_string(),
                    ));
                }
            }
        }

        if self.outputs.is_empty() {
            return Err(AppError::ConfigError("no output configured".to_string()));
        }

        for output in &self.outputs {
            if let OutputConfig::SizeRecord(c) = output {
                if c.interval.as_secs() == 0 {
                    return Err(AppError::ConfigError(
                        "size_record interval must be at least one second".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().expect("defaults should validate");
    }

    #[test]
    fn load_without_file_uses_defaults() {
        Jail::expect_with(|_| {
            let cfg = AppConfig::load(Path::new("missing.yml")).expect("defaults should load");
            assert_eq!(cfg.capture.snapshot_len, 65535);
            assert_eq!(cfg.handler.id_file, PathBuf::from("id.bin"));
            assert_eq!(
                cfg.capture.output_file.new_file_interval,
                Duration::from_secs(300)
            );
            Ok(())
        })
    }

    #[test]
    fn load_yaml_with_tagged_sections() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yml",
                r#"
capture:
  device_mode: deny
  devices: [lo]
  output_file:
    pcap_dir: /tmp/pcaps
    new_file_interval: 10m
upload:
  source: file
  pcap_dir: /tmp/pcaps/
  cursor:
    type: sqlite
    db_file: progress.db
outputs:
  - type: size_record
    interval: 30s
    timeout: 15s
    retry_times: 2
    sink:
      type: clickhouse
      url: http://localhost:8123
      database: traffic
      table: interval_traffic
  - type: stdout
"#,
            )?;

            let cfg = AppConfig::load(Path::new("config.yml")).expect("config should load");
            assert_eq!(cfg.capture.device_mode, DeviceMode::Deny);
            assert_eq!(cfg.capture.devices, vec!["lo".to_string()]);
            assert_eq!(
                cfg.capture.output_file.new_file_interval,
                Duration::from_secs(600)
            );
            assert!(matches!(cfg.upload.cursor, CursorConfig::Sqlite { .. }));
            assert_eq!(cfg.outputs.len(), 2);
            match &cfg.outputs[0] {
                OutputConfig::SizeRecord(c) => {
                    assert_eq!(c.interval, Duration::from_secs(30));
                    assert_eq!(c.retry_times, 2);
                    assert!(matches!(c.sink, SinkConfig::ClickHouse { .. }));
                }
                other => panic!("unexpected output {:?}", other),
            }
            Ok(())
        })
    }

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yml", "capture:\n  promiscuous: false\n")?;
            jail.set_env("FLOWSTAT_CAPTURE__PROMISCUOUS", "true");
            jail.set_env("FLOWSTAT_HANDLER__CHANNEL_SIZE", "8");

            let cfg = AppConfig::load(Path::new("config.yml")).expect("config should load");
            assert!(cfg.capture.promiscuous);
            assert_eq!(cfg.handler.channel_size, 8);
            Ok(())
        })
    }

    #[test]
    fn rotation_interval_must_divide_an_hour() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yml",
                "capture:\n  output_file:\n    new_file_interval: 7m\n",
            )?;

            let err = AppConfig::load(Path::new("config.yml")).expect_err("7m should be rejected");
            assert!(err.to_string().contains("divide"), "unexpected error: {}", err);
            Ok(())
        })
    }

    #[test]
    fn unparseable_duration_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yml", "handler:\n  flush_interval: soon\n")?;
            assert!(AppConfig::load(Path::new("config.yml")).is_err());
            Ok(())
        })
    }

    #[test]
    fn file_upload_needs_file_capture() {
        let mut cfg = AppConfig::default();
        cfg.capture.output = CaptureOutput::Live;
        assert!(cfg.validate().is_err());

        cfg.upload.source = UploadSource::LivePacket;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn captured_files_are_swept_from_the_capture_directory() {
        let mut cfg = AppConfig::default();
        cfg.capture.output_file.pcap_dir = PathBuf::from("/var/lib/flowstat/pcap");
        cfg.upload.pcap_dir = PathBuf::from("/var/lib/flowstat/other");
        let err = cfg.validate().expect_err("mismatched directories should be rejected");
        assert!(err.to_string().contains("pcap_dir"), "unexpected error: {}", err);

        cfg.upload.pcap_dir = PathBuf::from("/var/lib/flowstat/pcap/");
        assert!(cfg.validate().is_ok());

        // Upload-only runs may sweep any directory.
        cfg.capture.enabled = false;
        cfg.upload.pcap_dir = PathBuf::from("/srv/archive");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn capture_and_upload_cannot_both_be_disabled() {
        let mut cfg = AppConfig::default();
        cfg.capture.enabled = false;
        cfg.upload.enabled = false;
        assert!(cfg.validate().is_err());
    }
}
