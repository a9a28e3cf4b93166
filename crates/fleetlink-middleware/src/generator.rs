//! [`MessageGenerator`] – builds protocol envelopes from typed requests.
//!
//! Every envelope gets the next header id of its robot, the current time and
//! the fixed [`PROTOCOL_VERSION`].  Header ids are tracked per device in a
//! sharded concurrent map: the read-modify-write for one device happens under
//! that device's shard lock, so concurrent calls for the same device observe
//! distinct, strictly increasing ids while unrelated devices rarely contend.
//!
//! A request may carry an explicit `header_id` override (replay, testing).
//! Overrides are stamped as given and leave the device counter untouched.

use std::collections::HashMap;

use chrono::Utc;
use dashmap::DashMap;
use fleetlink_types::protocol::{FACTSHEET_ACTION_TYPE, INIT_POSITION_ACTION_TYPE};
use fleetlink_types::{
    Action, BlockingType, Edge, InstantActions, Node, Order, Pose, ProtocolMessage,
    PROTOCOL_VERSION,
};
use serde_json::json;
use uuid::Uuid;

/// Which robot a message is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub device_id: String,
    pub manufacturer: String,
}

impl DeviceAddress {
    pub fn new(device_id: impl Into<String>, manufacturer: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            manufacturer: manufacturer.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub device: DeviceAddress,
    pub order_id: String,
    pub order_update_id: u64,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub header_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InstantActionRequest {
    pub device: DeviceAddress,
    pub actions: Vec<Action>,
    pub header_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FactsheetRequest {
    pub device: DeviceAddress,
    pub header_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InitPositionRequest {
    pub device: DeviceAddress,
    pub pose: Pose,
    pub header_id: Option<u64>,
}

/// One constructor per envelope kind.
#[derive(Debug, Clone)]
pub enum MessageRequest {
    Order(OrderRequest),
    InstantActions(InstantActionRequest),
    FactsheetRequest(FactsheetRequest),
    InitPosition(InitPositionRequest),
}

impl MessageRequest {
    pub fn device(&self) -> &DeviceAddress {
        match self {
            MessageRequest::Order(r) => &r.device,
            MessageRequest::InstantActions(r) => &r.device,
            MessageRequest::FactsheetRequest(r) => &r.device,
            MessageRequest::InitPosition(r) => &r.device,
        }
    }
}

/// Stateful envelope builder.  Share one instance (behind an `Arc`) across
/// the whole process so header ids stay monotonic per device.
#[derive(Debug, Default)]
pub struct MessageGenerator {
    header_ids: DashMap<String, u64>,
}

impl MessageGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next header id for `device_id`.  The first id handed out
    /// for a device is `1`.
    pub fn next_header_id(&self, device_id: &str) -> u64 {
        let mut slot = self.header_ids.entry(device_id.to_string()).or_insert(0);
        *slot += 1;
        *slot
    }

    /// The last header id handed out for `device_id`, if any.
    pub fn last_header_id(&self, device_id: &str) -> Option<u64> {
        self.header_ids.get(device_id).map(|v| *v)
    }

    fn header_id(&self, device_id: &str, override_id: Option<u64>) -> u64 {
        override_id.unwrap_or_else(|| self.next_header_id(device_id))
    }

    /// Build the typed envelope for `request`.
    pub fn build(&self, request: MessageRequest) -> ProtocolMessage {
        match request {
            MessageRequest::Order(r) => ProtocolMessage::Order(Order {
                header_id: self.header_id(&r.device.device_id, r.header_id),
                timestamp: Utc::now(),
                version: PROTOCOL_VERSION.to_string(),
                manufacturer: r.device.manufacturer,
                serial_number: r.device.device_id,
                order_id: r.order_id,
                order_update_id: r.order_update_id,
                nodes: r.nodes,
                edges: r.edges,
            }),
            MessageRequest::InstantActions(r) => ProtocolMessage::InstantActions(
                self.instant_actions(r.device, r.header_id, r.actions),
            ),
            MessageRequest::FactsheetRequest(r) => {
                let action = Action::new(
                    FACTSHEET_ACTION_TYPE,
                    synthesized_action_id("factsheet"),
                    BlockingType::None,
                );
                ProtocolMessage::FactsheetRequest(self.instant_actions(
                    r.device,
                    r.header_id,
                    vec![action],
                ))
            }
            MessageRequest::InitPosition(r) => {
                let mut action = Action::new(
                    INIT_POSITION_ACTION_TYPE,
                    synthesized_action_id("init-position"),
                    BlockingType::Hard,
                )
                .with_parameter("x", json!(r.pose.x))
                .with_parameter("y", json!(r.pose.y))
                .with_parameter("theta", json!(r.pose.theta))
                .with_parameter("mapId", json!(r.pose.map_id));
                if let Some(node) = r.pose.last_node_id {
                    action = action.with_parameter("lastNodeId", json!(node));
                }
                ProtocolMessage::InitPosition(self.instant_actions(
                    r.device,
                    r.header_id,
                    vec![action],
                ))
            }
        }
    }

    /// Build and serialise `request` in one step.
    pub fn generate(&self, request: MessageRequest) -> Result<Vec<u8>, serde_json::Error> {
        self.build(request).to_bytes()
    }

    pub fn generate_order(&self, request: OrderRequest) -> Result<Vec<u8>, serde_json::Error> {
        self.generate(MessageRequest::Order(request))
    }

    pub fn generate_instant_action(
        &self,
        request: InstantActionRequest,
    ) -> Result<Vec<u8>, serde_json::Error> {
        self.generate(MessageRequest::InstantActions(request))
    }

    pub fn generate_factsheet_request(
        &self,
        request: FactsheetRequest,
    ) -> Result<Vec<u8>, serde_json::Error> {
        self.generate(MessageRequest::FactsheetRequest(request))
    }

    pub fn generate_init_position(
        &self,
        request: InitPositionRequest,
    ) -> Result<Vec<u8>, serde_json::Error> {
        self.generate(MessageRequest::InitPosition(request))
    }

    fn instant_actions(
        &self,
        device: DeviceAddress,
        header_id: Option<u64>,
        actions: Vec<Action>,
    ) -> InstantActions {
        InstantActions {
            header_id: self.header_id(&device.device_id, header_id),
            timestamp: Utc::now(),
            version: PROTOCOL_VERSION.to_string(),
            manufacturer: device.manufacturer,
            serial_number: device.device_id,
            actions,
        }
    }
}

fn synthesized_action_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Apply parameter overrides to every action of a node/edge graph.
///
/// Returns how many parameter values were replaced in total.
pub fn apply_overrides(
    nodes: &mut [Node],
    edges: &mut [Edge],
    overrides: &HashMap<String, serde_json::Value>,
) -> usize {
    if overrides.is_empty() {
        return 0;
    }
    nodes
        .iter_mut()
        .flat_map(|n| n.actions.iter_mut())
        .chain(edges.iter_mut().flat_map(|e| e.actions.iter_mut()))
        .map(|a| a.apply_overrides(overrides))
        .sum()
}
