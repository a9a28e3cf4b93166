//! Message-queue transport over MQTT.
//!
//! [`MqttTransport`] owns one broker connection:
//!
//! * **Outbound** – [`Transport::send`] publishes the envelope at QoS 1 and
//!   races the publish against the configured timeout, returning
//!   [`TransportError::PublishTimedOut`] instead of hanging.
//!
//! * **Inbound** – the background event loop subscribes to the `state`,
//!   `connection` and `factsheet` channels of every robot, parses each
//!   payload and publishes it on the internal [`EventBus`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetlink_types::{
    ConnectionState, DeviceState, Event, EventPayload, MessageKind, RequestContext,
    TransportError, TransportKind,
};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Topic};
use crate::destination::DestinationResolver;
use crate::transport::Transport;

/// Capacity of the client → event loop request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Upper bound for the reconnect back-off.
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

/// Broker connection settings.
#[derive(Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub publish_timeout: Duration,
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("keep_alive", &self.keep_alive)
            .field("publish_timeout", &self.publish_timeout)
            .finish()
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "fleetlink".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// MQTT implementation of [`Transport`].
pub struct MqttTransport {
    config: MqttConfig,
    resolver: DestinationResolver,
    bus: Option<Arc<EventBus>>,
    client: Mutex<Option<AsyncClient>>,
    /// Set on CONNACK, cleared on any connection error.
    connected: Arc<AtomicBool>,
    /// Set while the event loop task should keep polling.
    running: Arc<AtomicBool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig, resolver: DestinationResolver) -> Self {
        Self {
            config,
            resolver,
            bus: None,
            client: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            event_loop: Mutex::new(None),
        }
    }

    /// Forward inbound telemetry to `bus`.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// `true` once the broker acknowledged the connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Start the connection.  Calling `connect` on a transport that is
    /// already running is a no-op.
    ///
    /// The broker handshake completes in the background; use
    /// [`MqttTransport::wait_connected`] to block until it does.
    pub fn connect(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(host = %self.config.host, "mqtt transport already connected");
            return;
        }

        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user, pass);
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        *lock(&self.client) = Some(client.clone());

        let handle = tokio::spawn(run_event_loop(
            event_loop,
            client,
            self.resolver.clone(),
            self.bus.clone(),
            Arc::clone(&self.connected),
            Arc::clone(&self.running),
        ));
        *lock(&self.event_loop) = Some(handle);

        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            "mqtt transport connecting"
        );
    }

    /// Wait up to `timeout` for the broker handshake.  Returns whether the
    /// transport is connected.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Queue
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
        if !self.is_connected() {
            return Err(TransportError::NotConnected(TransportKind::Queue));
        }
        let client = lock(&self.client)
            .clone()
            .ok_or(TransportError::NotConnected(TransportKind::Queue))?;

        let publish = client.publish(destination, QoS::AtLeastOnce, false, payload.to_vec());
        tokio::select! {
            _ = ctx.cancelled() => Err(TransportError::Cancelled),
            result = tokio::time::timeout(self.config.publish_timeout, publish) => match result {
                Err(_) => Err(TransportError::PublishTimedOut {
                    destination: destination.to_string(),
                    timeout_ms: self.config.publish_timeout.as_millis() as u64,
                }),
                Ok(Err(e)) => Err(TransportError::SendFailed {
                    kind: TransportKind::Queue,
                    details: e.to_string(),
                }),
                Ok(Ok(())) => {
                    debug!(topic = destination, bytes = payload.len(), "mqtt publish queued");
                    Ok(())
                }
            },
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.running.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let client = lock(&self.client).take();
        let handle = lock(&self.event_loop).take();

        let result = match client {
            Some(client) => {
                match tokio::time::timeout(self.config.publish_timeout, client.disconnect()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(TransportError::SendFailed {
                        kind: TransportKind::Queue,
                        details: format!("disconnect failed: {e}"),
                    }),
                    Err(_) => Err(TransportError::SendFailed {
                        kind: TransportKind::Queue,
                        details: "disconnect timed out".to_string(),
                    }),
                }
            }
            None => Ok(()),
        };

        if let Some(handle) = handle {
            handle.abort();
        }
        result
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    resolver: DestinationResolver,
    bus: Option<Arc<EventBus>>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
) {
    let subscriptions: Vec<String> = [
        MessageKind::State,
        MessageKind::Connection,
        MessageKind::Factsheet,
    ]
    .iter()
    .map(|kind| resolver.wildcard_topic(*kind))
    .collect();
    let mut failures: u32 = 0;

    while running.load(Ordering::SeqCst) {
        match event_loop.poll().await {
            Ok(rumqttc::Event::Incoming(Packet::ConnAck(_))) => {
                failures = 0;
                connected.store(true, Ordering::SeqCst);
                info!("mqtt broker acknowledged connection");
                // Clean sessions drop subscriptions, so renew them on every CONNACK.
                for topic in &subscriptions {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        warn!(topic = %topic, error = %e, "mqtt subscribe failed");
                    }
                }
            }
            Ok(rumqttc::Event::Incoming(Packet::Publish(publish))) => {
                let Some(bus) = &bus else { continue };
                if let Some((topic, event)) =
                    route_inbound(&resolver, &publish.topic, &publish.payload)
                {
                    bus.publish_to(topic, event);
                }
            }
            Ok(rumqttc::Event::Incoming(Packet::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                warn!("mqtt broker sent disconnect");
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                failures = failures.saturating_add(1);
                let backoff = Duration::from_secs(u64::from(failures)).min(MAX_RECONNECT_BACKOFF);
                warn!(error = %e, attempt = failures, backoff_secs = backoff.as_secs(), "mqtt connection error");
                tokio::time::sleep(backoff).await;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    info!("mqtt event loop stopped");
}

/// Translate an inbound publish into a bus event.
///
/// Unknown topics are ignored; unparsable payloads are logged and dropped.
pub fn route_inbound(
    resolver: &DestinationResolver,
    topic: &str,
    payload: &[u8],
) -> Option<(Topic, Event)> {
    let Some((_, device_id, kind)) = resolver.parse_topic(topic) else {
        debug!(topic, "ignoring publish outside the protocol namespace");
        return None;
    };

    let parsed = match kind {
        MessageKind::State => serde_json::from_slice::<DeviceState>(payload)
            .map(|state| (Topic::Telemetry, EventPayload::DeviceState(state))),
        MessageKind::Connection => serde_json::from_slice::<ConnectionState>(payload)
            .map(|conn| (Topic::Connection, EventPayload::Connection(conn))),
        MessageKind::Factsheet => {
            serde_json::from_slice::<serde_json::Value>(payload).map(|document| {
                (
                    Topic::Telemetry,
                    EventPayload::Factsheet {
                        device_id: device_id.to_string(),
                        document,
                    },
                )
            })
        }
        MessageKind::Order | MessageKind::InstantActions | MessageKind::Visualization => {
            return None;
        }
    };

    match parsed {
        Ok((bus_topic, payload)) => Some((
            bus_topic,
            Event::new(format!("fleetlink-middleware::mqtt/{kind}"), payload),
        )),
        Err(e) => {
            warn!(topic, device_id, error = %e, "dropping unparsable telemetry");
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(publish_timeout: Duration) -> MqttTransport {
        MqttTransport::new(
            MqttConfig {
                publish_timeout,
                ..MqttConfig::default()
            },
            DestinationResolver::default(),
        )
    }

    /// Install a client whose event loop is never polled, so the request
    /// channel fills up and further publishes block.
    fn install_stalled_client(transport: &MqttTransport) -> EventLoop {
        let (client, event_loop) =
            AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 1);
        *lock(&transport.client) = Some(client);
        transport.connected.store(true, Ordering::SeqCst);
        event_loop
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        let transport = transport(Duration::from_millis(100));
        let err = transport
            .send(&RequestContext::background(), "uagv/v2/acme/agv-01/order", b"{}")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotConnected(TransportKind::Queue));
    }

    #[tokio::test]
    async fn stalled_publish_times_out() {
        let transport = transport(Duration::from_millis(50));
        let _event_loop = install_stalled_client(&transport);
        let ctx = RequestContext::background();

        transport.send(&ctx, "uagv/v2/acme/agv-01/order", b"{}").await.unwrap();
        let err = transport
            .send(&ctx, "uagv/v2/acme/agv-01/order", b"{}")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TransportError::PublishTimedOut {
                destination: "uagv/v2/acme/agv-01/order".to_string(),
                timeout_ms: 50,
            }
        );
    }

    #[tokio::test]
    async fn cancelled_context_aborts_send() {
        let transport = transport(Duration::from_secs(5));
        let _event_loop = install_stalled_client(&transport);
        let (ctx, handle) = RequestContext::with_cancel();
        transport.send(&ctx, "t", b"{}").await.unwrap();

        let pending = transport.send(&ctx, "t", b"{}");
        handle.cancel();
        assert_eq!(pending.await.unwrap_err(), TransportError::Cancelled);
    }

    #[tokio::test]
    async fn close_without_connect_is_ok_and_disables_sends() {
        let transport = transport(Duration::from_millis(50));
        assert!(transport.close().await.is_ok());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn connect_twice_is_a_no_op() {
        let transport = MqttTransport::new(
            MqttConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                ..MqttConfig::default()
            },
            DestinationResolver::default(),
        );
        transport.connect();
        transport.connect();
        assert!(lock(&transport.event_loop).is_some());
        assert!(transport.running.load(Ordering::SeqCst));
        assert!(!transport.wait_connected(Duration::from_millis(100)).await);

        let _ = transport.close().await;
        assert!(!transport.running.load(Ordering::SeqCst));
        assert!(lock(&transport.event_loop).is_none());
    }

    #[test]
    fn route_state_to_telemetry_topic() {
        let resolver = DestinationResolver::default();
        let payload = br#"{"serialNumber":"agv-01","orderId":"o-1","actionStates":[]}"#;
        let (topic, event) = route_inbound(&resolver, "uagv/v2/acme/agv-01/state", payload).unwrap();
        assert_eq!(topic, Topic::Telemetry);
        assert_eq!(event.source, "fleetlink-middleware::mqtt/state");
        assert!(matches!(event.payload, EventPayload::DeviceState(ref s) if s.order_id == "o-1"));
    }

    #[test]
    fn route_connection_to_connection_topic() {
        let resolver = DestinationResolver::default();
        let payload = br#"{"serialNumber":"agv-01","connectionState":"OFFLINE"}"#;
        let (topic, event) =
            route_inbound(&resolver, "uagv/v2/acme/agv-01/connection", payload).unwrap();
        assert_eq!(topic, Topic::Connection);
        assert!(matches!(event.payload, EventPayload::Connection(_)));
    }

    #[test]
    fn route_factsheet_keeps_raw_document() {
        let resolver = DestinationResolver::default();
        let payload = br#"{"manufacturer":"acme","typeSpecification":{"seriesName":"X1"}}"#;
        let (_, event) =
            route_inbound(&resolver, "uagv/v2/acme/agv-01/factsheet", payload).unwrap();
        match event.payload {
            EventPayload::Factsheet { device_id, document } => {
                assert_eq!(device_id, "agv-01");
                assert_eq!(document["typeSpecification"]["seriesName"], "X1");
            }
            other => panic!("expected factsheet, got {other:?}"),
        }
    }

    #[test]
    fn route_drops_garbage_and_foreign_topics() {
        let resolver = DestinationResolver::default();
        assert!(route_inbound(&resolver, "uagv/v2/acme/agv-01/state", b"not json").is_none());
        assert!(route_inbound(&resolver, "other/acme/agv-01/state", b"{}").is_none());
        assert!(route_inbound(&resolver, "uagv/v2/acme/agv-01/order", b"{}").is_none());
    }

    #[test]
    fn config_debug_redacts_password() {
        let cfg = MqttConfig {
            password: Some("hunter2".to_string()),
            ..MqttConfig::default()
        };
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
