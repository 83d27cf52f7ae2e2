use serde::{Deserialize, Serialize};

use crate::models::config::{CaptureConfig, CaptureOutput};

/// A network interface selected for capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDevice {
    /// Device system name (used for capture operations)
    pub name: String,

    /// Bytes kept per packet
    pub snapshot_len: i32,

    /// Whether promiscuous mode is requested
    pub promiscuous: bool,

    /// Whether packets are rotated into capture files
    pub file_output: bool,
}

impl CaptureDevice {
    /// Build a device from the shared capture settings
    pub fn from_config(name: impl Into<String>, config: &CaptureConfig) -> Self {
        Self {
            name: name.into(),
            snapshot_len: config.snapshot_len,
            promiscuous: config.promiscuous,
            file_output: config.output == CaptureOutput::File,
        }
    }
}
