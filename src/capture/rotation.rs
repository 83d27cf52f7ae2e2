use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::error::{AppError, AppResult};

/// Extension of every rotated capture file
pub const PCAP_SUFFIX: &str = ".pcap";

/// Date/time fields trailing the device name: YYYY, MM, DD, HH, minute
const TIME_FIELDS: usize = 5;

/// Bucket lengths must be whole minutes that divide one hour, so every
/// bucket boundary is aligned to the hour.
pub fn validate_interval(interval: Duration) -> AppResult<()> {
    let secs = interval.as_secs();
    if secs == 0 || interval.subsec_nanos() != 0 || secs % 60 != 0 || 3600 % secs != 0 {
        return Err(AppError::ConfigError(format!(
            "new_file_interval must be whole minutes and divide one hour, got {}",
            humantime::format_duration(interval)
        )));
    }
    Ok(())
}

/// Maps packet timestamps to deterministic per-device bucket files
#[derive(Debug, Clone)]
pub struct Rotation {
    dir: PathBuf,
    period_minutes: u32,
}

impl Rotation {
    /// Validate the interval and make sure the output directory exists
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> AppResult<Self> {
        validate_interval(interval)?;
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            period_minutes: (interval.as_secs() / 60) as u32,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start of the bucket containing `t`
    pub fn bucket_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let minute = t.minute() / self.period_minutes * self.period_minutes;
        t.with_minute(minute)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(t)
    }

    /// `{device}-{YYYY-MM-DD-HH}-{minute}.pcap` for the bucket containing `t`
    pub fn file_name(&self, device: &str, t: DateTime<Utc>) -> String {
        let start = self.bucket_start(t);
        format!(
            "{}-{}-{}{}",
            device,
            start.format("%Y-%m-%d-%H"),
            start.minute(),
            PCAP_SUFFIX
        )
    }

    pub fn file_path(&self, device: &str, t: DateTime<Utc>) -> PathBuf {
        self.dir.join(self.file_name(device, t))
    }
}

/// Whether a directory entry name looks like a capture file
pub fn is_capture_file(name: &str) -> bool {
    name.ends_with(PCAP_SUFFIX)
}

/// Recover the device and bucket start from a bucket file name (or path).
///
/// Device names may themselves contain `-`, so the time fields are peeled
/// off from the right. The minute is not zero padded.
pub fn bucket_from_file_name(name: &str) -> Option<(&str, NaiveDateTime)> {
    let base = Path::new(name).file_name()?.to_str()?;
    let stem = base.strip_suffix(PCAP_SUFFIX)?;

    let fields: Vec<&str> = stem.rsplitn(TIME_FIELDS + 1, '-').collect();
    if fields.len() != TIME_FIELDS + 1 {
        return None;
    }
    if !fields[..TIME_FIELDS]
        .iter()
        .all(|f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }

    let device = fields[TIME_FIELDS];
    if device.is_empty() {
        return None;
    }

    // rsplitn yields right to left: minute, hour, day, month, year
    let minute: u32 = fields[0].parse().ok()?;
    let hour: u32 = fields[1].parse().ok()?;
    let day: u32 = fields[2].parse().ok()?;
    let month: u32 = fields[3].parse().ok()?;
    let year: i32 = fields[4].parse().ok()?;
    let start = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
    Some((device, start))
}

/// Recover the device from a bucket file name (or path)
pub fn device_from_file_name(name: &str) -> Option<&str> {
    bucket_from_file_name(name).map(|(device, _)| device)
}
