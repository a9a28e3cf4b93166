//! `fleetlink-middleware` – the wire side of the bridge.
//!
//! Builds protocol envelopes, works out where they go, and moves bytes to
//! robots over whichever transport is registered for the job.  Inbound
//! telemetry is parsed and fanned out over the internal event bus.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`transport`] – the [`Transport`] trait every wire implementation
//!   satisfies.
//! - [`mqtt`], [`http`], [`stream`] – the three transports.
//! - [`registry`] – one live transport per kind plus the default kind.
//! - [`destination`] – topic / URL resolution per robot and message kind.
//! - [`generator`] – envelope construction and per-robot header ids.

pub mod bus;
pub mod destination;
pub mod generator;
pub mod http;
pub mod mqtt;
pub mod registry;
pub mod stream;
pub mod transport;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use destination::DestinationResolver;
pub use generator::{
    DeviceAddress, FactsheetRequest, InitPositionRequest, InstantActionRequest, MessageGenerator,
    MessageRequest, OrderRequest,
};
pub use http::HttpTransport;
pub use mqtt::{MqttConfig, MqttTransport};
pub use registry::{CloseErrors, TransportRegistry};
pub use stream::StreamTransport;
pub use transport::Transport;
