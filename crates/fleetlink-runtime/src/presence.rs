//! Device presence: who is reachable and which manufacturer they report.
//!
//! [`PresenceProvider`] is what the execution engine asks before it
//! dispatches anything.  [`PresenceTracker`] is the in-process
//! implementation, fed by the telemetry ingestor from `connection`, `state`
//! and factsheet messages.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use fleetlink_types::{ConnectionState, DeviceState};
use tracing::{debug, info};

/// Manufacturer used for devices that never reported one.
pub const DEFAULT_FALLBACK_MANUFACTURER: &str = "fleetlink";

pub trait PresenceProvider: Send + Sync {
    fn is_online(&self, device_id: &str) -> bool;

    /// The device's manufacturer, or the configured fallback when unknown.
    fn manufacturer(&self, device_id: &str) -> String;
}

#[derive(Debug, Clone)]
struct DevicePresence {
    online: bool,
    manufacturer: Option<String>,
    last_seen: DateTime<Utc>,
}

pub struct PresenceTracker {
    devices: RwLock<HashMap<String, DevicePresence>>,
    fallback_manufacturer: String,
}

impl PresenceTracker {
    pub fn new(fallback_manufacturer: impl Into<String>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            fallback_manufacturer: fallback_manufacturer.into(),
        }
    }

    /// Mark `device_id` online, recording `manufacturer` when given.
    pub fn set_online(&self, device_id: &str, manufacturer: Option<&str>) {
        let mut devices = self.write();
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DevicePresence {
                online: false,
                manufacturer: None,
                last_seen: Utc::now(),
            });
        if !entry.online {
            info!(device_id, "device online");
        }
        entry.online = true;
        entry.last_seen = Utc::now();
        if let Some(m) = manufacturer.filter(|m| !m.is_empty()) {
            entry.manufacturer = Some(m.to_string());
        }
    }

    /// Mark `device_id` offline.  Returns whether it was online before.
    pub fn set_offline(&self, device_id: &str) -> bool {
        let mut devices = self.write();
        match devices.get_mut(device_id) {
            Some(entry) if entry.online => {
                entry.online = false;
                entry.last_seen = Utc::now();
                info!(device_id, "device offline");
                true
            }
            _ => false,
        }
    }

    /// Apply a `connection` message.  Returns the device's new online flag.
    pub fn observe_connection(&self, connection: &ConnectionState) -> bool {
        if connection.connection_state.is_online() {
            self.set_online(&connection.serial_number, Some(&connection.manufacturer));
            true
        } else {
            self.set_offline(&connection.serial_number);
            false
        }
    }

    /// A device that reports state is reachable.
    pub fn observe_state(&self, state: &DeviceState) {
        self.set_online(&state.serial_number, Some(&state.manufacturer));
    }

    /// Record the manufacturer named in a factsheet document.  Does not
    /// change the online flag.
    pub fn observe_factsheet(&self, device_id: &str, document: &serde_json::Value) {
        let Some(manufacturer) = document
            .get("manufacturer")
            .and_then(|m| m.as_str())
            .filter(|m| !m.is_empty())
        else {
            debug!(device_id, "factsheet without manufacturer ignored");
            return;
        };
        let mut devices = self.write();
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DevicePresence {
                online: false,
                manufacturer: None,
                last_seen: Utc::now(),
            });
        entry.manufacturer = Some(manufacturer.to_string());
    }

    /// Online devices, sorted.
    pub fn online_devices(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .read()
            .iter()
            .filter(|(_, p)| p.online)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn last_seen(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.read().get(device_id).map(|p| p.last_seen)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DevicePresence>> {
        self.devices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DevicePresence>> {
        self.devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_MANUFACTURER)
    }
}

impl PresenceProvider for PresenceTracker {
    fn is_online(&self, device_id: &str) -> bool {
        self.read().get(device_id).is_some_and(|p| p.online)
    }

    fn manufacturer(&self, device_id: &str) -> String {
        self.read()
            .get(device_id)
            .and_then(|p| p.manufacturer.clone())
            .unwrap_or_else(|| self.fallback_manufacturer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlink_types::ConnectionStatus;
    use serde_json::json;

    fn connection(device: &str, status: ConnectionStatus) -> ConnectionState {
        ConnectionState {
            header_id: 1,
            timestamp: None,
            manufacturer: "acme".to_string(),
            serial_number: device.to_string(),
            connection_state: status,
        }
    }

    #[test]
    fn unknown_device_is_offline_with_fallback_manufacturer() {
        let tracker = PresenceTracker::new("generic");
        assert!(!tracker.is_online("agv-01"));
        assert_eq!(tracker.manufacturer("agv-01"), "generic");
    }

    #[test]
    fn connection_messages_toggle_presence() {
        let tracker = PresenceTracker::default();
        assert!(tracker.observe_connection(&connection("agv-01", ConnectionStatus::Online)));
        assert!(tracker.is_online("agv-01"));
        assert_eq!(tracker.manufacturer("agv-01"), "acme");

        assert!(!tracker.observe_connection(&connection(
            "agv-01",
            ConnectionStatus::ConnectionBroken
        )));
        assert!(!tracker.is_online("agv-01"));
        assert_eq!(tracker.manufacturer("agv-01"), "acme");
    }

    #[test]
    fn set_offline_reports_previous_state() {
        let tracker = PresenceTracker::default();
        assert!(!tracker.set_offline("agv-01"));
        tracker.set_online("agv-01", None);
        assert!(tracker.set_offline("agv-01"));
        assert!(!tracker.set_offline("agv-01"));
    }

    #[test]
    fn empty_manufacturer_does_not_overwrite_known_one() {
        let tracker = PresenceTracker::default();
        tracker.set_online("agv-01", Some("acme"));
        tracker.set_online("agv-01", Some(""));
        assert_eq!(tracker.manufacturer("agv-01"), "acme");
    }

    #[test]
    fn factsheet_sets_manufacturer_without_marking_online() {
        let tracker = PresenceTracker::default();
        tracker.observe_factsheet("agv-02", &json!({ "manufacturer": "robotco" }));
        assert_eq!(tracker.manufacturer("agv-02"), "robotco");
        assert!(!tracker.is_online("agv-02"));
        tracker.observe_factsheet("agv-02", &json!({ "typeSpecification": {} }));
        assert_eq!(tracker.manufacturer("agv-02"), "robotco");
    }

    #[test]
    fn online_devices_are_sorted() {
        let tracker = PresenceTracker::default();
        tracker.set_online("agv-02", None);
        tracker.set_online("agv-01", None);
        tracker.set_online("agv-03", None);
        tracker.set_offline("agv-03");
        assert_eq!(tracker.online_devices(), vec!["agv-01", "agv-02"]);
        assert!(tracker.last_seen("agv-03").is_some());
    }
}
