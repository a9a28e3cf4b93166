//! Shared fixtures for the runtime integration tests: an engine wired to an
//! in-memory store, a recording transport and an in-memory template
//! catalog.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetlink_kernel::StatusCache;
use fleetlink_middleware::{EventBus, Transport, TransportRegistry};
use fleetlink_runtime::{
    ExecutionEngine, InMemoryTemplateRepository, PresenceTracker, TelemetryIngestor,
};
use fleetlink_store::OrderRecordStore;
use fleetlink_types::{
    DeviceState, OrderStatus, RequestContext, TransportError, TransportKind,
};
use serde_json::json;

pub const DEVICE: &str = "agv-01";
pub const MANUFACTURER: &str = "acme";

pub const CATALOG: &str = r#"{
    "actionTemplates": [
        { "id": "pick", "actionType": "pick", "blockingType": "HARD",
          "parameters": { "stationType": "floor", "height": 0.2 } },
        { "id": "drop", "actionType": "drop", "blockingType": "HARD",
          "parameters": { "height": 0.0 } }
    ],
    "orderTemplates": [
        { "id": "shuttle", "name": "Shuttle A to B",
          "nodes": [
            { "nodeId": "A", "sequenceId": 0, "actionTemplateIds": ["pick"] },
            { "nodeId": "B", "sequenceId": 2, "actionTemplateIds": ["drop"] }
          ],
          "edges": [
            { "edgeId": "A-B", "sequenceId": 1, "startNodeId": "A", "endNodeId": "B" }
          ] }
    ]
}"#;

/// Records every payload it is asked to send, or fails with a preset error.
pub struct RecordingTransport {
    kind: TransportKind,
    pub sent: Mutex<Vec<(String, Vec<u8>)>>,
    fail_with: Mutex<Option<TransportError>>,
    slow_device: Mutex<Option<(String, Duration)>>,
}

impl RecordingTransport {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            sent: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
            slow_device: Mutex::new(None),
        })
    }

    /// Hold every send addressed to `device` for `delay`.
    pub fn delay_sends_to(&self, device: &str, delay: Duration) {
        *self.slow_device.lock().unwrap() = Some((format!("/{device}/"), delay));
    }

    pub fn fail_with(&self, error: TransportError) {
        *self.fail_with.lock().unwrap() = Some(error);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// The `n`th payload, parsed back into JSON.
    pub fn payload(&self, n: usize) -> serde_json::Value {
        serde_json::from_slice(&self.sent.lock().unwrap()[n].1).unwrap()
    }

    pub fn destination(&self, n: usize) -> String {
        self.sent.lock().unwrap()[n].0.clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        destination: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if ctx.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let delay = self
            .slow_device
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(segment, _)| destination.contains(segment.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.fail_with.lock().unwrap().clone() {
            return Err(e);
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct Harness {
    pub engine: Arc<ExecutionEngine>,
    pub presence: Arc<PresenceTracker>,
    pub transport: Arc<RecordingTransport>,
    pub store: OrderRecordStore,
    pub bus: EventBus,
}

impl Harness {
    pub fn new() -> Self {
        let templates = Arc::new(InMemoryTemplateRepository::from_catalog(
            serde_json::from_str(CATALOG).unwrap(),
        ));
        let presence = Arc::new(PresenceTracker::new("fallback"));
        presence.set_online(DEVICE, Some(MANUFACTURER));

        let registry = Arc::new(TransportRegistry::new(TransportKind::Queue));
        let transport = RecordingTransport::new(TransportKind::Queue);
        registry.register(TransportKind::Queue, transport.clone());

        let store = OrderRecordStore::open_in_memory().unwrap();
        let bus = EventBus::default();
        let engine = Arc::new(
            ExecutionEngine::new(templates, presence.clone(), registry, store.clone())
                .with_bus(bus.clone()),
        );
        Self {
            engine,
            presence,
            transport,
            store,
            bus,
        }
    }

    pub fn ingestor(&self) -> TelemetryIngestor {
        TelemetryIngestor::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.presence),
            Arc::new(StatusCache::new()),
            self.bus.clone(),
        )
    }

    /// Number of records in any status.
    pub async fn record_count(&self) -> u64 {
        let mut total = 0;
        for status in [
            OrderStatus::Created,
            OrderStatus::Sent,
            OrderStatus::Started,
            OrderStatus::Completed,
            OrderStatus::Failed,
            OrderStatus::Cancelled,
        ] {
            total += self.store.count_by_status(status, None).await.unwrap();
        }
        total
    }
}

pub fn ctx() -> RequestContext {
    RequestContext::background()
}

/// A state message for `device` reporting `actions` as `(actionId, status)`.
pub fn state(device: &str, order_id: &str, actions: &[(&str, &str)]) -> DeviceState {
    let action_states: Vec<_> = actions
        .iter()
        .map(|(id, status)| json!({ "actionId": id, "actionStatus": status }))
        .collect();
    serde_json::from_value(json!({
        "headerId": 7,
        "manufacturer": MANUFACTURER,
        "serialNumber": device,
        "orderId": order_id,
        "actionStates": action_states,
    }))
    .unwrap()
}
