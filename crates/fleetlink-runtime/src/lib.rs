//! `fleetlink-runtime` – orchestration.
//!
//! Wires the wire layer, the record store and the correlation kernel into
//! the operations an operator surface calls.
//!
//! # Modules
//!
//! - [`engine`] – [`ExecutionEngine`][engine::ExecutionEngine]: templated
//!   orders and direct commands, the persist-then-send unit of work, record
//!   lifecycle calls, pending-command sweeps and record queries.
//! - [`ingest`] – [`TelemetryIngestor`][ingest::TelemetryIngestor]: consumes
//!   parsed telemetry from the event bus, feeds the status cache and settles
//!   pending commands.
//! - [`presence`] – the [`PresenceProvider`][presence::PresenceProvider]
//!   collaborator and its in-process [`PresenceTracker`][presence::PresenceTracker].
//! - [`templates`] – the [`TemplateRepository`][templates::TemplateRepository]
//!   collaborator and a JSON-loadable in-memory implementation.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console or
//!   JSON logs plus optional OTLP span export.

pub mod engine;
pub mod ingest;
pub mod presence;
pub mod telemetry;
pub mod templates;

pub use engine::{CANCEL_REASON, ExecutionEngine, ExecutionResult, RawOrder};
pub use ingest::TelemetryIngestor;
pub use presence::{PresenceProvider, PresenceTracker};
pub use telemetry::{LogFormat, TelemetryGuard, TracingSettings, init_tracing};
pub use templates::{
    InMemoryTemplateRepository, OrderGraph, TemplateCatalog, TemplateLoadError,
    TemplateRepository,
};
