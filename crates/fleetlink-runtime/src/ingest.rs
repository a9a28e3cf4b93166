//! [`TelemetryIngestor`] – the bus consumer that closes the loop between
//! robot telemetry and the execution engine.
//!
//! | Inbound | Effect |
//! |---|---|
//! | `state` | presence refresh; [`Topic::StatusUpdates`] event when the status cache (and the optional rate limiter) let it through; correlation of pending commands |
//! | `connection` | presence update; an offline device's pending commands are failed |
//! | factsheet | manufacturer recorded in the presence tracker |
//!
//! Telemetry that matches nothing is logged at debug level and dropped.
//! Nothing here returns an error to a caller.

use std::sync::Arc;

use fleetlink_kernel::{RateLimiter, StatusCache};
use fleetlink_middleware::{EventBus, Topic};
use fleetlink_types::{
    CommandResult, ConnectionState, DeviceState, DeviceStatus, Event, EventPayload,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::ExecutionEngine;
use crate::presence::PresenceTracker;

const EVENT_SOURCE: &str = "fleetlink-runtime::ingest";

pub struct TelemetryIngestor {
    engine: Arc<ExecutionEngine>,
    presence: Arc<PresenceTracker>,
    status_cache: Arc<StatusCache<DeviceStatus>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    bus: EventBus,
}

impl TelemetryIngestor {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        presence: Arc<PresenceTracker>,
        status_cache: Arc<StatusCache<DeviceStatus>>,
        bus: EventBus,
    ) -> Self {
        Self {
            engine,
            presence,
            status_cache,
            rate_limiter: None,
            bus,
        }
    }

    /// Throttle status change events per device.  A throttled change is not
    /// recorded in the status cache, so the next state carrying it is
    /// offered again.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Process one state message.  Returns the results of every command it
    /// settled.
    pub async fn handle_state(&self, state: &DeviceState) -> Vec<CommandResult> {
        let device_id = state.serial_number.as_str();
        self.presence.observe_state(state);

        let status = state.summary();
        let changed = self
            .status_cache
            .check_and_update_with(device_id, status.clone(), || self.admit(device_id));
        if changed {
            debug!(device_id, "device status changed");
            self.bus.publish(Event::new(
                EVENT_SOURCE,
                EventPayload::DeviceStatusChanged {
                    device_id: device_id.to_string(),
                    status,
                },
            ));
        }

        let settlements = self.engine.pending().correlate(state);
        if settlements.is_empty() {
            debug!(device_id, actions = state.action_states.len(), "state matched no settled command");
            return Vec::new();
        }
        let mut results = Vec::with_capacity(settlements.len());
        for settlement in settlements {
            results.push(self.engine.apply_settlement(settlement).await);
        }
        results
    }

    /// Process one connection message.  Returns the results of the commands
    /// failed because the device went offline.
    pub async fn handle_connection(&self, connection: &ConnectionState) -> Vec<CommandResult> {
        if self.presence.observe_connection(connection) {
            return Vec::new();
        }
        let device_id = connection.serial_number.as_str();
        if let Some(limiter) = &self.rate_limiter {
            limiter.reset(device_id);
        }
        let reason = format!(
            "device {device_id} reported {:?}",
            connection.connection_state
        );
        self.engine
            .fail_pending_for_device(device_id, &reason)
            .await
    }

    fn admit(&self, device_id: &str) -> bool {
        match &self.rate_limiter {
            Some(limiter) if !limiter.allow(device_id) => {
                debug!(device_id, "status change throttled");
                false
            }
            _ => true,
        }
    }

    pub fn handle_factsheet(&self, device_id: &str, document: &serde_json::Value) {
        self.presence.observe_factsheet(device_id, document);
        info!(device_id, "factsheet received");
    }

    /// Dispatch a bus event to the matching handler.  Events the ingestor
    /// does not consume are ignored.
    pub async fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::DeviceState(state) => {
                self.handle_state(state).await;
            }
            EventPayload::Connection(connection) => {
                self.handle_connection(connection).await;
            }
            EventPayload::Factsheet {
                device_id,
                document,
            } => self.handle_factsheet(device_id, document),
            EventPayload::DeviceStatusChanged { .. } | EventPayload::CommandResult(_) => {}
        }
    }

    /// Consume [`Topic::Telemetry`] and [`Topic::Connection`] until the bus
    /// closes or the handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut telemetry = self.bus.subscribe_to(Topic::Telemetry);
        let mut connection = self.bus.subscribe_to(Topic::Connection);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    r = telemetry.recv() => r,
                    r = connection.recv() => r,
                };
                match received {
                    Ok(event) => self.handle_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "telemetry ingestor lagged; events dropped");
                    }
                    Err(RecvError::Closed) => {
                        info!("event bus closed; telemetry ingestor stopping");
                        break;
                    }
                }
            }
        })
    }
}
