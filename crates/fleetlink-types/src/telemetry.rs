//! Inbound device telemetry and the outcomes derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Action states
// ─────────────────────────────────────────────────────────────────────────────

/// Execution status of a single action as reported by the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionStatus {
    Waiting,
    Initializing,
    Running,
    Paused,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionState {
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    pub action_status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_description: Option<String>,
}

impl ActionState {
    pub fn new(action_id: impl Into<String>, action_status: ActionStatus) -> Self {
        Self {
            action_id: action_id.into(),
            action_type: None,
            action_status,
            result_description: None,
        }
    }
}

/// A robot-side error entry carried in a state message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFault {
    pub error_type: String,
    #[serde(default)]
    pub error_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// State message
// ─────────────────────────────────────────────────────────────────────────────

/// Parsed `state` message.  Only the fields the bridge acts upon are kept;
/// unknown fields are ignored on deserialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    #[serde(default)]
    pub header_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub manufacturer: String,
    pub serial_number: String,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_update_id: u64,
    #[serde(default)]
    pub last_node_id: String,
    #[serde(default)]
    pub driving: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_mode: Option<String>,
    #[serde(default)]
    pub action_states: Vec<ActionState>,
    #[serde(default)]
    pub errors: Vec<DeviceFault>,
}

impl DeviceState {
    /// The active order id, treating the protocol's empty string as absent.
    pub fn active_order(&self) -> Option<&str> {
        if self.order_id.is_empty() {
            None
        } else {
            Some(&self.order_id)
        }
    }

    /// Condense the state into the fields that matter for change detection.
    ///
    /// Header ids and timestamps change on every message and are excluded.
    pub fn summary(&self) -> DeviceStatus {
        DeviceStatus {
            order_id: self.order_id.clone(),
            last_node_id: self.last_node_id.clone(),
            driving: self.driving,
            paused: self.paused,
            operating_mode: self.operating_mode.clone(),
            error_count: self.errors.len(),
            running_actions: self
                .action_states
                .iter()
                .filter(|s| s.action_status == ActionStatus::Running)
                .count(),
        }
    }
}

/// Change-detection projection of a [`DeviceState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub order_id: String,
    pub last_node_id: String,
    pub driving: bool,
    pub paused: bool,
    pub operating_mode: Option<String>,
    pub error_count: usize,
    pub running_actions: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection message
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Online,
    Offline,
    #[serde(rename = "CONNECTIONBROKEN")]
    ConnectionBroken,
}

impl ConnectionStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionStatus::Online)
    }
}

/// Parsed `connection` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    #[serde(default)]
    pub header_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub manufacturer: String,
    pub serial_number: String,
    pub connection_state: ConnectionStatus,
}

// ─────────────────────────────────────────────────────────────────────────────
// Command outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Three-valued outcome of evaluating a pending command's action states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    InProgress,
    Success,
    Failure,
}

impl Verdict {
    pub fn is_decided(&self) -> bool {
        !matches!(self, Verdict::InProgress)
    }
}

/// Final report for a correlated command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub correlation_key: String,
    pub device_id: String,
    pub command_text: String,
    pub verdict: Verdict,
    /// Failure reason or robot-provided result description.
    pub message: Option<String>,
    pub finished_at: DateTime<Utc>,
}
