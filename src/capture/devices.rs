use log::{info, warn};

use crate::models::config::DeviceMode;
use crate::utils::error::{AppError, AppResult};

/// Names of all devices libpcap can open
pub fn available_devices() -> AppResult<Vec<String>> {
    let devices = pcap::Device::list()?;
    Ok(devices.into_iter().map(|d| d.name).collect())
}

/// Apply the allow/deny list to the live device list.
///
/// Allow keeps configured names that exist, in configured order; deny keeps
/// every live device that is not named.
pub fn select_devices(mode: DeviceMode, configured: &[String], available: &[String]) -> Vec<String> {
    match mode {
        DeviceMode::Allow => configured
            .iter()
            .filter(|name| {
                let found = available.contains(name);
                if !found {
                    warn!("Configured device {} does not exist, skipping", name);
                }
                found
            })
            .cloned()
            .collect(),
        DeviceMode::Deny => available
            .iter()
            .filter(|name| !configured.contains(name))
            .cloned()
            .collect(),
    }
}

/// Resolve the devices to capture; an empty selection is fatal
pub fn resolve_devices(mode: DeviceMode, configured: &[String]) -> AppResult<Vec<String>> {
    let available = available_devices()?;
    let selected = select_devices(mode, configured, &available);
    if selected.is_empty() {
        return Err(AppError::CaptureError("no device to capture".to_string()));
    }
    info!("Capturing on {} device(s): {:?}", selected.len(), selected);
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn allow_list_keeps_existing_names_in_order() {
        let available = names(&["lo", "eth0", "eth1"]);
        let configured = names(&["eth1", "wlan0", "lo"]);
        assert_eq!(
            select_devices(DeviceMode::Allow, &configured, &available),
            names(&["eth1", "lo"])
        );
    }

    #[test]
    fn deny_list_keeps_everything_else() {
        let available = names(&["lo", "eth0", "eth1"]);
        let configured = names(&["lo"]);
        assert_eq!(
            select_devices(DeviceMode::Deny, &configured, &available),
            names(&["eth0", "eth1"])
        );
    }

    #[test]
    fn empty_allow_list_selects_nothing() {
        let available = names(&["lo", "eth0"]);
        assert!(select_devices(DeviceMode::Allow, &[], &available).is_empty());
    }
}
