//! Outbound protocol envelopes.
//!
//! Every message the bridge sends to a robot is one of the four
//! [`ProtocolMessage`] variants.  Field names follow the wire format
//! (camelCase JSON) so an envelope serialises directly into the bytes that
//! go onto the transport.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol version stamped on every generated envelope.
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// Action type used for the synthesized factsheet request.
pub const FACTSHEET_ACTION_TYPE: &str = "factsheetRequest";

/// Action type used for the synthesized init-position command.
pub const INIT_POSITION_ACTION_TYPE: &str = "initPosition";

// ─────────────────────────────────────────────────────────────────────────────
// Actions
// ─────────────────────────────────────────────────────────────────────────────

/// How an action interacts with driving and with other actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockingType {
    /// May run in parallel with driving and other actions.
    #[default]
    None,
    /// Runs in parallel with other actions but the robot must not drive.
    Soft,
    /// No other action and no driving while this action runs.
    Hard,
}

/// One `key → value` pair of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParameter {
    pub key: String,
    pub value: serde_json::Value,
}

/// A single action attached to a node, an edge, or sent as an instant action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub action_type: String,
    /// Unique within the robot's current context; used to correlate
    /// `actionStates` in telemetry.
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_description: Option<String>,
    pub blocking_type: BlockingType,
    #[serde(default)]
    pub action_parameters: Vec<ActionParameter>,
}

impl Action {
    pub fn new(
        action_type: impl Into<String>,
        action_id: impl Into<String>,
        blocking_type: BlockingType,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            action_id: action_id.into(),
            action_description: None,
            blocking_type,
            action_parameters: Vec::new(),
        }
    }

    /// Builder-style helper that appends a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.action_parameters.push(ActionParameter {
            key: key.into(),
            value,
        });
        self
    }

    /// Look up a parameter value by key.
    pub fn parameter(&self, key: &str) -> Option<&serde_json::Value> {
        self.action_parameters
            .iter()
            .find(|p| p.key == key)
            .map(|p| &p.value)
    }

    /// Replace the value of every parameter whose key appears in
    /// `overrides`.  Keys that match no parameter are ignored.
    ///
    /// Returns the number of parameters that were replaced.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, serde_json::Value>) -> usize {
        let mut replaced = 0;
        for param in &mut self.action_parameters {
            if let Some(value) = overrides.get(&param.key) {
                param.value = value.clone();
                replaced += 1;
            }
        }
        replaced
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Order graph
// ─────────────────────────────────────────────────────────────────────────────

/// Position of a node on a map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theta: Option<f64>,
    pub map_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub sequence_id: u32,
    pub released: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_position: Option<NodePosition>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub edge_id: String,
    pub sequence_id: u32,
    pub released: bool,
    pub start_node_id: String,
    pub end_node_id: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Robot pose used by the init-position command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub map_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node_id: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelopes
// ─────────────────────────────────────────────────────────────────────────────

/// A full order: a node/edge graph with attached actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub header_id: u64,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub manufacturer: String,
    pub serial_number: String,
    pub order_id: String,
    pub order_update_id: u64,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Order {
    /// Ids of every action in the order, nodes first, in graph order.
    pub fn action_ids(&self) -> Vec<String> {
        self.nodes
            .iter()
            .flat_map(|n| n.actions.iter())
            .chain(self.edges.iter().flat_map(|e| e.actions.iter()))
            .map(|a| a.action_id.clone())
            .collect()
    }
}

/// Out-of-band actions that are not part of an order graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantActions {
    pub header_id: u64,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub manufacturer: String,
    pub serial_number: String,
    pub actions: Vec<Action>,
}

/// Every envelope the bridge can emit.
///
/// The factsheet request and init-position variants are instant-action
/// messages carrying exactly one synthesized action; they are kept as
/// separate variants so dispatch on message type stays exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProtocolMessage {
    Order(Order),
    InstantActions(InstantActions),
    FactsheetRequest(InstantActions),
    InitPosition(InstantActions),
}

impl ProtocolMessage {
    pub fn header_id(&self) -> u64 {
        match self {
            ProtocolMessage::Order(o) => o.header_id,
            ProtocolMessage::InstantActions(i)
            | ProtocolMessage::FactsheetRequest(i)
            | ProtocolMessage::InitPosition(i) => i.header_id,
        }
    }

    pub fn serial_number(&self) -> &str {
        match self {
            ProtocolMessage::Order(o) => &o.serial_number,
            ProtocolMessage::InstantActions(i)
            | ProtocolMessage::FactsheetRequest(i)
            | ProtocolMessage::InitPosition(i) => &i.serial_number,
        }
    }

    pub fn manufacturer(&self) -> &str {
        match self {
            ProtocolMessage::Order(o) => &o.manufacturer,
            ProtocolMessage::InstantActions(i)
            | ProtocolMessage::FactsheetRequest(i)
            | ProtocolMessage::InitPosition(i) => &i.manufacturer,
        }
    }

    /// The topic / path suffix this envelope is published under.
    pub fn kind(&self) -> MessageKind {
        match self {
            ProtocolMessage::Order(_) => MessageKind::Order,
            ProtocolMessage::InstantActions(_)
            | ProtocolMessage::FactsheetRequest(_)
            | ProtocolMessage::InitPosition(_) => MessageKind::InstantActions,
        }
    }

    /// Ids of every action carried by the envelope.
    pub fn action_ids(&self) -> Vec<String> {
        match self {
            ProtocolMessage::Order(o) => o.action_ids(),
            ProtocolMessage::InstantActions(i)
            | ProtocolMessage::FactsheetRequest(i)
            | ProtocolMessage::InitPosition(i) => {
                i.actions.iter().map(|a| a.action_id.clone()).collect()
            }
        }
    }

    /// Serialise to the JSON wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message kinds
// ─────────────────────────────────────────────────────────────────────────────

/// The protocol's message channels, used as the last topic segment or URL
/// path suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Order,
    InstantActions,
    State,
    Connection,
    Factsheet,
    Visualization,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Order => "order",
            MessageKind::InstantActions => "instantActions",
            MessageKind::State => "state",
            MessageKind::Connection => "connection",
            MessageKind::Factsheet => "factsheet",
            MessageKind::Visualization => "visualization",
        }
    }

    pub fn from_topic_segment(s: &str) -> Option<Self> {
        match s {
            "order" => Some(MessageKind::Order),
            "instantActions" => Some(MessageKind::InstantActions),
            "state" => Some(MessageKind::State),
            "connection" => Some(MessageKind::Connection),
            "factsheet" => Some(MessageKind::Factsheet),
            "visualization" => Some(MessageKind::Visualization),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
