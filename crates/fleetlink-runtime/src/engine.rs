//! [`ExecutionEngine`] – turns operator intents into dispatched envelopes
//! and keeps their execution records honest.
//!
//! # Dispatch
//!
//! Every dispatch, templated or direct, follows the same path:
//!
//! 1. Resolve everything that can fail without side effects: the template
//!    graph, the device's presence, the transport kind.  Failures here are
//!    returned as-is and leave no record behind.
//! 2. Build the envelope (minting the device's next header id).
//! 3. Open a [`UnitOfWork`], which commits the record as `CREATED`, and, for
//!    direct commands, register a [`PendingCommand`].
//! 4. Send with no store lock held.  Success moves the record to `SENT`; a
//!    transport failure moves it to `FAILED` with the error text.  A
//!    cancelled send discards the unit of work instead, so the record never
//!    existed.  A record cancelled by the operator mid-send stays
//!    `CANCELLED`.
//!
//! # Finalisation
//!
//! Direct commands are finalised from telemetry through
//! [`ExecutionEngine::apply_settlement`].  Templated orders are finalised by
//! explicit [`mark_started`](ExecutionEngine::mark_started) /
//! [`mark_completed`](ExecutionEngine::mark_completed) calls.  Sweeps
//! ([`fail_all_pending`](ExecutionEngine::fail_all_pending) and friends) fail
//! whatever is still outstanding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetlink_kernel::{PendingCommand, PendingCommands, Settlement};
use fleetlink_middleware::generator::apply_overrides;
use fleetlink_middleware::{
    DestinationResolver, DeviceAddress, EventBus, FactsheetRequest, InitPositionRequest,
    InstantActionRequest, MessageGenerator, MessageRequest, OrderRequest, TransportRegistry,
};
use fleetlink_store::{NewOrderRecord, OrderRecord, OrderRecordStore, StoreError, UnitOfWork};
use fleetlink_types::{
    Action, BridgeError, CommandResult, Edge, Event, EventPayload, Node, OrderStatus, Pose,
    ProtocolMessage, RequestContext, TransportError, TransportKind, Verdict,
};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::presence::PresenceProvider;
use crate::templates::TemplateRepository;

/// Reason stored on records cancelled through [`ExecutionEngine::cancel_order`].
pub const CANCEL_REASON: &str = "cancelled by operator";

const EVENT_SOURCE: &str = "fleetlink-runtime::engine";

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub order_id: String,
    pub device_id: String,
    pub status: OrderStatus,
    pub transport: TransportKind,
    pub header_id: u64,
    pub destination: String,
}

/// A caller-built order graph dispatched without a template.
#[derive(Debug, Clone)]
pub struct RawOrder {
    pub order_id: String,
    pub order_update_id: u64,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Everything the shared dispatch path needs, fully resolved.
struct Dispatch {
    record: NewOrderRecord,
    message: ProtocolMessage,
    transport: TransportKind,
    /// `Some` for direct commands, which are correlated from telemetry.
    command_text: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ExecutionEngine
// ─────────────────────────────────────────────────────────────────────────────

pub struct ExecutionEngine {
    templates: Arc<dyn TemplateRepository>,
    presence: Arc<dyn PresenceProvider>,
    generator: Arc<MessageGenerator>,
    resolver: DestinationResolver,
    registry: Arc<TransportRegistry>,
    store: OrderRecordStore,
    pending: Arc<PendingCommands>,
    bus: Option<EventBus>,
}

impl ExecutionEngine {
    pub fn new(
        templates: Arc<dyn TemplateRepository>,
        presence: Arc<dyn PresenceProvider>,
        registry: Arc<TransportRegistry>,
        store: OrderRecordStore,
    ) -> Self {
        Self {
            templates,
            presence,
            generator: Arc::new(MessageGenerator::new()),
            resolver: DestinationResolver::default(),
            registry,
            store,
            pending: Arc::new(PendingCommands::new()),
            bus: None,
        }
    }

    /// Share a generator with other producers so header ids stay monotonic
    /// per device across all of them.
    pub fn with_generator(mut self, generator: Arc<MessageGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_resolver(mut self, resolver: DestinationResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_pending(mut self, pending: Arc<PendingCommands>) -> Self {
        self.pending = pending;
        self
    }

    /// Publish command results on `bus`.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn pending(&self) -> &Arc<PendingCommands> {
        &self.pending
    }

    pub fn store(&self) -> &OrderRecordStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    pub fn generator(&self) -> &Arc<MessageGenerator> {
        &self.generator
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Expand `template_id`, apply `overrides` and dispatch the resulting
    /// order to `device_id`.  `transport` of `None` uses the registry
    /// default.
    ///
    /// # Errors
    ///
    /// Template and presence failures are returned before any record is
    /// written.  A transport failure is returned after the record has been
    /// committed as `FAILED`.
    #[instrument(skip_all, fields(template_id = %template_id, device_id = %device_id))]
    pub async fn execute_order(
        &self,
        ctx: &RequestContext,
        template_id: &str,
        device_id: &str,
        overrides: &HashMap<String, serde_json::Value>,
        transport: Option<TransportKind>,
    ) -> Result<ExecutionResult, BridgeError> {
        let mut graph = self.templates.get_template_with_graph(template_id)?;
        self.ensure_online(device_id)?;
        let transport = transport.unwrap_or_else(|| self.registry.default_kind());

        let replaced = apply_overrides(&mut graph.nodes, &mut graph.edges, overrides);
        debug!(replaced, overrides = overrides.len(), "parameter overrides applied");

        let order_id = format!("order-{}", Uuid::new_v4());
        let message = self.generator.build(MessageRequest::Order(OrderRequest {
            device: self.address(device_id),
            order_id: order_id.clone(),
            order_update_id: 0,
            nodes: graph.nodes,
            edges: graph.edges,
            header_id: None,
        }));
        self.dispatch(
            ctx,
            Dispatch {
                record: NewOrderRecord::new(order_id, device_id).with_template(template_id),
                message,
                transport,
                command_text: None,
            },
        )
        .await
    }

    /// Dispatch a caller-built order.  The order id doubles as the
    /// correlation key, so the robot's `state.orderId` settles it.
    #[instrument(skip_all, fields(device_id = %device_id, order_id = %order.order_id))]
    pub async fn execute_raw_order(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        order: RawOrder,
        command_text: &str,
        transport: Option<TransportKind>,
    ) -> Result<ExecutionResult, BridgeError> {
        self.ensure_online(device_id)?;
        let transport = transport.unwrap_or_else(|| self.registry.default_kind());
        let message = self.generator.build(MessageRequest::Order(OrderRequest {
            device: self.address(device_id),
            order_id: order.order_id.clone(),
            order_update_id: order.order_update_id,
            nodes: order.nodes,
            edges: order.edges,
            header_id: None,
        }));
        self.dispatch(
            ctx,
            Dispatch {
                record: NewOrderRecord::new(order.order_id, device_id)
                    .with_revision(order.order_update_id),
                message,
                transport,
                command_text: Some(command_text.to_string()),
            },
        )
        .await
    }

    #[instrument(skip_all, fields(device_id = %device_id, actions = actions.len()))]
    pub async fn execute_instant_actions(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        actions: Vec<Action>,
        command_text: &str,
        transport: Option<TransportKind>,
    ) -> Result<ExecutionResult, BridgeError> {
        self.ensure_online(device_id)?;
        let transport = transport.unwrap_or_else(|| self.registry.default_kind());
        let message = self
            .generator
            .build(MessageRequest::InstantActions(InstantActionRequest {
                device: self.address(device_id),
                actions,
                header_id: None,
            }));
        self.dispatch_command(ctx, device_id, message, transport, command_text)
            .await
    }

    #[instrument(skip_all, fields(device_id = %device_id))]
    pub async fn request_factsheet(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        transport: Option<TransportKind>,
    ) -> Result<ExecutionResult, BridgeError> {
        self.ensure_online(device_id)?;
        let transport = transport.unwrap_or_else(|| self.registry.default_kind());
        let message = self
            .generator
            .build(MessageRequest::FactsheetRequest(FactsheetRequest {
                device: self.address(device_id),
                header_id: None,
            }));
        self.dispatch_command(ctx, device_id, message, transport, "factsheet request")
            .await
    }

    #[instrument(skip_all, fields(device_id = %device_id, map_id = %pose.map_id))]
    pub async fn init_position(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        pose: Pose,
        transport: Option<TransportKind>,
    ) -> Result<ExecutionResult, BridgeError> {
        self.ensure_online(device_id)?;
        let transport = transport.unwrap_or_else(|| self.registry.default_kind());
        let command_text = format!(
            "init position x={} y={} theta={} map={}",
            pose.x, pose.y, pose.theta, pose.map_id
        );
        let message = self
            .generator
            .build(MessageRequest::InitPosition(InitPositionRequest {
                device: self.address(device_id),
                pose,
                header_id: None,
            }));
        self.dispatch_command(ctx, device_id, message, transport, &command_text)
            .await
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Cancel a non-terminal record.  Any pending entry for it is dropped
    /// and reported as failed with [`CANCEL_REASON`].
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidStateTransition`] when the record is already
    /// terminal; the record is left untouched.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: &str) -> Result<OrderRecord, BridgeError> {
        let record = self
            .store
            .update_status(order_id, OrderStatus::Cancelled, Some(CANCEL_REASON))
            .await?;
        if let Some(command) = self.pending.remove(order_id) {
            self.publish_result(command.into_result(Verdict::Failure, Some(CANCEL_REASON.into())));
        }
        info!(order_id, device_id = %record.device_id, "order cancelled");
        Ok(record)
    }

    /// Move a record to `status`, enforcing the lifecycle.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        error_message: Option<&str>,
    ) -> Result<OrderRecord, BridgeError> {
        Ok(self
            .store
            .update_status(order_id, status, error_message)
            .await?)
    }

    pub async fn mark_started(&self, order_id: &str) -> Result<OrderRecord, BridgeError> {
        self.update_order_status(order_id, OrderStatus::Started, None)
            .await
    }

    pub async fn mark_completed(&self, order_id: &str) -> Result<OrderRecord, BridgeError> {
        self.update_order_status(order_id, OrderStatus::Completed, None)
            .await
    }

    pub async fn mark_failed(
        &self,
        order_id: &str,
        reason: &str,
    ) -> Result<OrderRecord, BridgeError> {
        self.update_order_status(order_id, OrderStatus::Failed, Some(reason))
            .await
    }

    /// Finalise the record behind a settled pending command and report it.
    ///
    /// Never fails: a record that is missing or already terminal is logged
    /// and left alone, and the result is still reported.
    pub async fn apply_settlement(&self, settlement: Settlement) -> CommandResult {
        let Settlement {
            command,
            verdict,
            message,
        } = settlement;
        let status = if verdict == Verdict::Success {
            OrderStatus::Completed
        } else {
            OrderStatus::Failed
        };
        self.finalize(&command.correlation_key, status, message.as_deref())
            .await;
        let result = command.into_result(verdict, message);
        self.publish_result(result.clone());
        result
    }

    /// Fail every pending command with `reason`.  Returns one result per
    /// command that was pending.
    pub async fn fail_all_pending(&self, reason: &str) -> Vec<CommandResult> {
        let drained = self.pending.drain_all();
        self.fail_commands(drained, reason).await
    }

    /// Fail the pending commands of one device, e.g. after it disconnected.
    pub async fn fail_pending_for_device(
        &self,
        device_id: &str,
        reason: &str,
    ) -> Vec<CommandResult> {
        let drained = self.pending.drain_device(device_id);
        self.fail_commands(drained, reason).await
    }

    /// Fail pending commands that have waited longer than `ttl`.
    pub async fn expire_pending(&self, ttl: Duration) -> Vec<CommandResult> {
        let expired = self.pending.take_expired(ttl);
        if expired.is_empty() {
            return Vec::new();
        }
        let reason = format!("no result within {}s", ttl.as_secs());
        self.fail_commands(expired, &reason).await
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub async fn get_order(&self, order_id: &str) -> Result<OrderRecord, BridgeError> {
        Ok(self.store.get(order_id).await?)
    }

    pub async fn list_orders_by_device(
        &self,
        device_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OrderRecord>, BridgeError> {
        Ok(self.store.list_by_device(device_id, limit, offset).await?)
    }

    pub async fn list_orders_by_status(
        &self,
        status: OrderStatus,
    ) -> Result<Vec<OrderRecord>, BridgeError> {
        Ok(self.store.list_by_status(status).await?)
    }

    pub async fn count_orders_by_status(
        &self,
        status: OrderStatus,
        device_id: Option<&str>,
    ) -> Result<u64, BridgeError> {
        Ok(self.store.count_by_status(status, device_id).await?)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn ensure_online(&self, device_id: &str) -> Result<(), BridgeError> {
        if self.presence.is_online(device_id) {
            Ok(())
        } else {
            warn!(device_id, "dispatch refused: device not online");
            Err(BridgeError::DeviceNotOnline(device_id.to_string()))
        }
    }

    fn address(&self, device_id: &str) -> DeviceAddress {
        DeviceAddress::new(device_id, self.presence.manufacturer(device_id))
    }

    async fn dispatch_command(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        message: ProtocolMessage,
        transport: TransportKind,
        command_text: &str,
    ) -> Result<ExecutionResult, BridgeError> {
        let command_id = format!("cmd-{}", Uuid::new_v4());
        self.dispatch(
            ctx,
            Dispatch {
                record: NewOrderRecord::new(command_id, device_id),
                message,
                transport,
                command_text: Some(command_text.to_string()),
            },
        )
        .await
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        dispatch: Dispatch,
    ) -> Result<ExecutionResult, BridgeError> {
        let Dispatch {
            record,
            message,
            transport,
            command_text,
        } = dispatch;
        let order_id = record.order_id.clone();
        let device_id = record.device_id.clone();
        let header_id = message.header_id();
        let destination = self.resolver.resolve(
            &device_id,
            message.manufacturer(),
            message.kind(),
            transport,
        );
        let payload = message.to_bytes()?;

        let uow = self.store.begin(&record).await?;
        if let Some(text) = command_text {
            self.pending.insert(PendingCommand::new(
                &order_id,
                &device_id,
                text,
                message.action_ids(),
            ));
        }

        let sent = self
            .registry
            .send(ctx, transport, &destination, &payload)
            .await;
        let outcome = self.record_outcome(uow, sent);
        if outcome.is_err() {
            self.pending.remove(&order_id);
        }
        let status = outcome?;

        info!(
            order_id = %order_id,
            device_id = %device_id,
            transport = %transport,
            header_id,
            destination = %destination,
            "dispatched"
        );
        Ok(ExecutionResult {
            order_id,
            device_id,
            status,
            transport,
            header_id,
            destination,
        })
    }

    /// Record the send outcome on the unit of work.
    fn record_outcome(
        &self,
        uow: UnitOfWork,
        sent: Result<(), TransportError>,
    ) -> Result<OrderStatus, BridgeError> {
        let order_id = uow.order_id().to_string();
        match sent {
            Ok(()) => match uow.commit_sent() {
                Ok(record) => Ok(record.status),
                Err(StoreError::InvalidStateTransition { from, .. }) => {
                    warn!(order_id, current = %from, "record changed while sending; kept as is");
                    Ok(from)
                }
                Err(e) => Err(e.into()),
            },
            Err(TransportError::Cancelled) => {
                uow.discard()?;
                warn!(order_id, "send cancelled; record discarded");
                Err(TransportError::Cancelled.into())
            }
            Err(e) => {
                let reason = e.to_string();
                match uow.commit_failed(&reason) {
                    Ok(_) => error!(order_id, error = %e, "send failed; record marked FAILED"),
                    Err(StoreError::InvalidStateTransition { from, .. }) => {
                        warn!(order_id, current = %from, error = %e, "send failed after the record changed; kept as is");
                    }
                    Err(store_err) => return Err(store_err.into()),
                }
                Err(e.into())
            }
        }
    }

    async fn fail_commands(
        &self,
        commands: Vec<PendingCommand>,
        reason: &str,
    ) -> Vec<CommandResult> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            self.finalize(&command.correlation_key, OrderStatus::Failed, Some(reason))
                .await;
            let result = command.into_result(Verdict::Failure, Some(reason.to_string()));
            self.publish_result(result.clone());
            results.push(result);
        }
        if !results.is_empty() {
            warn!(count = results.len(), reason, "pending commands failed");
        }
        results
    }

    async fn finalize(&self, order_id: &str, status: OrderStatus, message: Option<&str>) {
        match self.store.update_status(order_id, status, message).await {
            Ok(record) => {
                info!(order_id, device_id = %record.device_id, status = %record.status, "order finalised");
            }
            Err(StoreError::InvalidStateTransition { from, .. }) => {
                warn!(order_id, current = %from, requested = %status, "record already final; left untouched");
            }
            Err(e) => {
                warn!(order_id, error = %e, "could not finalise order record");
            }
        }
    }

    fn publish_result(&self, result: CommandResult) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::new(EVENT_SOURCE, EventPayload::CommandResult(result)));
        }
    }
}
