//! `fleetlink-types` – shared vocabulary of the fleet bridge.
//!
//! # Modules
//!
//! - [`protocol`] – outbound envelopes (orders, instant actions, factsheet
//!   requests, init-position) and their node/edge/action graph.
//! - [`telemetry`] – inbound state and connection messages, verdicts and
//!   command results.
//! - [`context`] – [`RequestContext`], the cooperative cancellation signal
//!   carried through transport sends.

pub mod context;
pub mod protocol;
pub mod telemetry;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use context::{CancelHandle, RequestContext};
pub use protocol::{
    Action, ActionParameter, BlockingType, Edge, InstantActions, MessageKind, Node, NodePosition,
    Order, Pose, ProtocolMessage, PROTOCOL_VERSION,
};
pub use telemetry::{
    ActionState, ActionStatus, CommandResult, ConnectionState, ConnectionStatus, DeviceFault,
    DeviceState, DeviceStatus, Verdict,
};

/// Wire transport used to reach a robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Message-queue publish (MQTT).
    Queue,
    /// HTTP POST.
    Http,
    /// Streaming socket (WebSocket).
    Stream,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Queue => "queue",
            TransportKind::Http => "http",
            TransportKind::Stream => "stream",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" | "mqtt" => Ok(TransportKind::Queue),
            "http" => Ok(TransportKind::Http),
            "stream" | "websocket" | "ws" => Ok(TransportKind::Stream),
            other => Err(BridgeError::UnknownTransport(other.to_string())),
        }
    }
}

/// Lifecycle status of an order execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Sent,
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Sent => "SENT",
            OrderStatus::Started => "STARTED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(OrderStatus::Created),
            "SENT" => Some(OrderStatus::Sent),
            "STARTED" => Some(OrderStatus::Started),
            "COMPLETED" => Some(OrderStatus::Completed),
            "FAILED" => Some(OrderStatus::Failed),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// `COMPLETED`, `FAILED` and `CANCELLED` admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }

    /// Whether the lifecycle admits `self → next`.
    ///
    /// `FAILED` and `CANCELLED` are reachable from every non-terminal state.
    /// `STARTED` is optional between `SENT` and `COMPLETED`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed | Cancelled) => true,
            (Created, Sent) => true,
            (Sent, Started | Completed) => true,
            (Started, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified event wrapper for the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "fleetlink-middleware::mqtt/state"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    DeviceState(DeviceState),
    Connection(ConnectionState),
    /// Raw factsheet document; the bridge only reads its manufacturer.
    Factsheet {
        device_id: String,
        document: serde_json::Value,
    },
    /// Emitted when the status cache lets a state update through.
    DeviceStatusChanged {
        device_id: String,
        status: DeviceStatus,
    },
    CommandResult(CommandResult),
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failures raised by a transport.  Returned to the caller verbatim; the
/// transport layer never retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No transport registered for kind '{0}'")]
    NotRegistered(TransportKind),

    #[error("Transport '{0}' is not connected")]
    NotConnected(TransportKind),

    #[error("Publish to '{destination}' timed out after {timeout_ms} ms")]
    PublishTimedOut { destination: String, timeout_ms: u64 },

    #[error("Send over '{kind}' failed: {details}")]
    SendFailed { kind: TransportKind, details: String },

    #[error("HTTP POST to '{url}' returned status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Send cancelled by request context")]
    Cancelled,

    #[error("Payload serialization failed: {0}")]
    Serialization(String),
}

/// Error taxonomy surfaced to callers of the bridge core.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Device '{0}' is not online")]
    DeviceNotOnline(String),

    #[error("Order template not found: {0}")]
    TemplateNotFound(String),

    #[error("Action template not found: {0}")]
    ActionTemplateNotFound(String),

    #[error("Order execution record not found: {0}")]
    OrderNotFound(String),

    #[error("Invalid state transition for order {order_id}: {from} -> {to}")]
    InvalidStateTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Unknown transport '{0}' (expected queue, http or stream)")]
    UnknownTransport(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_parses_aliases_case_insensitively() {
        assert_eq!("MQTT".parse::<TransportKind>().unwrap(), TransportKind::Queue);
        assert_eq!("queue".parse::<TransportKind>().unwrap(), TransportKind::Queue);
        assert_eq!(" Http ".parse::<TransportKind>().unwrap(), TransportKind::Http);
        assert_eq!("websocket".parse::<TransportKind>().unwrap(), TransportKind::Stream);
    }

    #[test]
    fn transport_kind_rejects_typos() {
        let err = "htp".parse::<TransportKind>().unwrap_err();
        assert!(matches!(err, BridgeError::UnknownTransport(ref s) if s == "htp"));
    }

    #[test]
    fn order_status_string_roundtrip() {
        for status in [
            OrderStatus::Created,
            OrderStatus::Sent,
            OrderStatus::Started,
            OrderStatus::Completed,
            OrderStatus::Failed,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("sent"), None);
    }

    #[test]
    fn only_final_states_are_terminal() {
        assert!(!OrderStatus::Created.is_terminal());
        assert!(!OrderStatus::Sent.is_terminal());
        assert!(!OrderStatus::Started.is_terminal());
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
    }

    #[test]
    fn lifecycle_transitions() {
        use OrderStatus::*;
        assert!(Created.can_transition_to(Sent));
        assert!(Created.can_transition_to(Failed));
        assert!(Sent.can_transition_to(Completed));
        assert!(Sent.can_transition_to(Started));
        assert!(Started.can_transition_to(Cancelled));
        assert!(!Created.can_transition_to(Completed));
        assert!(!Started.can_transition_to(Sent));
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Created, Sent, Started, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn transport_error_wraps_into_bridge_error() {
        let err: BridgeError = TransportError::NotRegistered(TransportKind::Stream).into();
        assert!(err.to_string().contains("stream"));
        assert!(matches!(
            err,
            BridgeError::Transport(TransportError::NotRegistered(TransportKind::Stream))
        ));
    }

    #[test]
    fn event_roundtrip() {
        let event = Event::new(
            "fleetlink-middleware::mqtt/connection",
            EventPayload::Connection(ConnectionState {
                header_id: 3,
                timestamp: None,
                manufacturer: "acme".to_string(),
                serial_number: "agv-01".to_string(),
                connection_state: ConnectionStatus::Online,
            }),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        assert_eq!(event.source, back.source);
    }
}
