//! The transport abstraction.
//!
//! The bridge never speaks directly to MQTT, HTTP or WebSockets.  It hands a
//! serialised envelope and a destination to a [`Transport`], and the
//! transport owns everything about the wire: connection lifecycle,
//! timeouts and error mapping.
//!
//! - [`MqttTransport`][crate::mqtt::MqttTransport] – publishes to a broker.
//! - [`HttpTransport`][crate::http::HttpTransport] – POSTs to a per-robot URL.
//! - [`StreamTransport`][crate::stream::StreamTransport] – writes text frames
//!   to a per-robot WebSocket.

use async_trait::async_trait;
use fleetlink_types::{RequestContext, TransportError, TransportKind};

/// Every wire transport must implement this trait.
///
/// # Contract
///
/// * `send` delivers `payload` to `destination` (a topic or a URL,
///   depending on the transport).  Failures are returned as typed
///   [`TransportError`]s and are never retried here.  A cancelled `ctx`
///   aborts the send with [`TransportError::Cancelled`].
/// * `close` releases the transport's connections.  Sends after `close`
///   fail with [`TransportError::NotConnected`].
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn send(
        &self,
        ctx: &RequestContext,
        destination: &str,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
