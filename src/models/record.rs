use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;

use crate::utils::error::{AppError, AppResult};

/// Generic event handed to output plugins: tagged record fields by name.
pub type Event = Map<String, Value>;

/// A captured packet normalized for aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRecord {
    /// Global, increasing sequence number
    pub id: u64,

    /// Interface the packet was captured on
    pub device: String,

    /// Capture timestamp of the packet
    pub create_time: DateTime<Utc>,

    /// Wire length, inflated for segmentation of oversized packets
    pub size: i32,

    /// Source IP address
    pub src_ip: Option<IpAddr>,

    /// Destination IP address
    pub dst_ip: Option<IpAddr>,
}

impl NetworkRecord {
    /// Flatten into an event map. Zero and empty fields are left out.
    pub fn to_event(&self) -> Event {
        let mut event = Map::new();
        if self.id != 0 {
            event.insert("id".to_string(), Value::from(self.id));
        }
        if !self.device.is_empty() {
            event.insert("device".to_string(), Value::from(self.device.clone()));
        }
        event.insert(
            "create_time".to_string(),
            Value::from(self.create_time.to_rfc3339()),
        );
        if self.size != 0 {
            event.insert("size".to_string(), Value::from(self.size));
        }
        if let Some(ip) = self.src_ip {
            event.insert("src_ip".to_string(), Value::from(ip.to_string()));
        }
        if let Some(ip) = self.dst_ip {
            event.insert("dst_ip".to_string(), Value::from(ip.to_string()));
        }
        event
    }
}

impl TryFrom<&Event> for NetworkRecord {
    type Error = AppError;

    fn try_from(event: &Event) -> AppResult<Self> {
        let create_time = event
            .get("create_time")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::PacketParsingError("event has no create_time".to_string()))?;
        let create_time = DateTime::parse_from_rfc3339(create_time)
            .map_err(|e| AppError::PacketParsingError(format!("bad create_time: {}", e)))?
            .with_timezone(&Utc);

        let device = event
            .get("device")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::PacketParsingError("event has no device".to_string()))?
            .to_string();

        let size = match event.get("size") {
            None => 0,
            Some(v) => v
                .as_i64()
                .and_then(|s| i32::try_from(s).ok())
                .ok_or_else(|| AppError::PacketParsingError(format!("bad size: {}", v)))?,
        };

        Ok(Self {
            id: event.get("id").and_then(Value::as_u64).unwrap_or(0),
            device,
            create_time,
            size,
            src_ip: ip_field(event, "src_ip")?,
            dst_ip: ip_field(event, "dst_ip")?,
        })
    }
}

fn ip_field(event: &Event, name: &str) -> AppResult<Option<IpAddr>> {
    match event.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| AppError::PacketParsingError(format!("bad {}: {}", name, s))),
        Some(other) => Err(AppError::PacketParsingError(format!(
            "bad {}: {}",
            name, other
        ))),
    }
}
