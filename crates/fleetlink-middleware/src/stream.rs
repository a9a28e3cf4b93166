//! WebSocket transport.
//!
//! One socket per robot URL, opened lazily on the first send and reused
//! afterwards.  A socket that fails a write is dropped so the next send
//! reconnects.  Connecting to one robot never holds up sends to another.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleetlink_types::{RequestContext, TransportError, TransportKind};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::transport::Transport;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One robot's connection.  Empty until the first send connects it, and
/// again after a failed write.
type Slot = Arc<Mutex<Option<Socket>>>;

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StreamTransport {
    /// Locked only to look up or insert a slot, never across I/O.
    slots: std::sync::Mutex<HashMap<String, Slot>>,
    /// Bounds connect plus write of a single send.
    timeout: Duration,
    closed: AtomicBool,
}

impl StreamTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: std::sync::Mutex::new(HashMap::new()),
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of sockets currently held open.
    pub async fn open_sockets(&self) -> usize {
        let slots: Vec<Slot> = self.slots().values().cloned().collect();
        let mut open = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                open += 1;
            }
        }
        open
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, url: &str) -> Slot {
        Arc::clone(self.slots().entry(url.to_string()).or_default())
    }

    /// Sends to one URL are serialised on its slot; other robots are not
    /// affected by a slow connect or write here.
    async fn deliver(&self, url: &str, payload: &[u8]) -> Result<(), TransportError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| TransportError::Serialization(e.to_string()))?
            .to_string();
        let slot = self.slot(url);
        let mut held = slot.lock().await;
        let socket = match held.take() {
            Some(socket) => socket,
            None => {
                let (socket, _) =
                    connect_async(url)
                        .await
                        .map_err(|e| TransportError::SendFailed {
                            kind: TransportKind::Stream,
                            details: format!("connect to {url} failed: {e}"),
                        })?;
                info!(url, "websocket opened");
                socket
            }
        };
        let socket = held.insert(socket);
        if let Err(e) = socket.send(Message::Text(text.into())).await {
            *held = None;
            warn!(url, error = %e, "websocket write failed; socket dropped");
            return Err(TransportError::SendFailed {
                kind: TransportKind::Stream,
                details: e.to_string(),
            });
        }
        debug!(url, bytes = payload.len(), "websocket frame sent");
        Ok(())
    }
}

impl Default for StreamTransport {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_TIMEOUT)
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        destination: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected(TransportKind::Stream));
        }
        if ctx.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        tokio::select! {
            _ = ctx.cancelled() => Err(TransportError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.deliver(destination, payload)) => {
                result.unwrap_or_else(|_| Err(TransportError::PublishTimedOut {
                    destination: destination.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let slots: Vec<(String, Slot)> = self.slots().drain().collect();

        let mut failures = Vec::new();
        for (url, slot) in slots {
            let Some(mut socket) = slot.lock().await.take() else {
                continue;
            };
            if let Err(e) = socket.close(None).await {
                warn!(url = %url, error = %e, "websocket close failed");
                failures.push(format!("{url}: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TransportError::SendFailed {
                kind: TransportKind::Stream,
                details: failures.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;

    /// Robot-side WebSocket server.  Forwards every text frame to the
    /// returned channel and counts accepted connections.
    async fn robot_server() -> (String, mpsc::UnboundedReceiver<Message>, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        let closing = msg.is_close();
                        let _ = tx.send(msg);
                        if closing {
                            break;
                        }
                    }
                });
            }
        });
        (format!("ws://{addr}/vda5050"), rx, accepted)
    }

    #[tokio::test]
    async fn sends_text_frames_over_one_socket() {
        let (url, mut frames, accepted) = robot_server().await;
        let transport = StreamTransport::default();
        let ctx = RequestContext::background();

        transport.send(&ctx, &url, br#"{"headerId":1}"#).await.unwrap();
        transport.send(&ctx, &url, br#"{"headerId":2}"#).await.unwrap();

        assert_eq!(frames.recv().await.unwrap().to_text().unwrap(), r#"{"headerId":1}"#);
        assert_eq!(frames.recv().await.unwrap().to_text().unwrap(), r#"{"headerId":2}"#);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(transport.open_sockets().await, 1);
    }

    #[tokio::test]
    async fn close_sends_close_frame_and_rejects_later_sends() {
        let (url, mut frames, _) = robot_server().await;
        let transport = StreamTransport::default();
        let ctx = RequestContext::background();
        transport.send(&ctx, &url, b"{}").await.unwrap();
        let _ = frames.recv().await;

        transport.close().await.unwrap();
        assert!(frames.recv().await.unwrap().is_close());
        assert_eq!(transport.open_sockets().await, 0);
        assert_eq!(
            transport.send(&ctx, &url, b"{}").await,
            Err(TransportError::NotConnected(TransportKind::Stream))
        );
    }

    #[tokio::test]
    async fn unreachable_robot_is_send_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = StreamTransport::new(Duration::from_secs(2));

        let err = transport
            .send(&RequestContext::background(), &format!("ws://{addr}/x"), b"{}")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::SendFailed { kind: TransportKind::Stream, .. }
        ));
        assert_eq!(transport.open_sockets().await, 0);
    }

    #[tokio::test]
    async fn stalled_handshake_does_not_block_other_robots() {
        // Accepts TCP but never answers the WebSocket handshake.
        let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stalled_url = format!("ws://{}/x", stalled.local_addr().unwrap());
        let held = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = stalled.accept().await {
                open.push(stream);
            }
        });
        let (url, mut frames, _) = robot_server().await;
        let transport = Arc::new(StreamTransport::new(Duration::from_secs(3)));

        let stuck = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .send(&RequestContext::background(), &stalled_url, b"{}")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        transport
            .send(&RequestContext::background(), &url, br#"{"headerId":1}"#)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(frames.recv().await.unwrap().to_text().unwrap(), r#"{"headerId":1}"#);

        stuck.abort();
        held.abort();
    }

    #[tokio::test]
    async fn non_utf8_payload_is_rejected() {
        let (url, _frames, _) = robot_server().await;
        let transport = StreamTransport::default();
        let err = transport
            .send(&RequestContext::background(), &url, &[0xff, 0xfe])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Serialization(_)));
    }
}
