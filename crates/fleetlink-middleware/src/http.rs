//! HTTP transport: one JSON POST per envelope.
//!
//! A single [`reqwest::Client`] with a request timeout is shared by every
//! send so connection pooling works across robots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleetlink_types::{RequestContext, TransportError, TransportKind};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::transport::Transport;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Build a transport whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::SendFailed {
                kind: TransportKind::Http,
                details: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    async fn post(&self, url: &str, payload: &[u8]) -> Result<(), TransportError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::PublishTimedOut {
                        destination: url.to_string(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    TransportError::SendFailed {
                        kind: TransportKind::Http,
                        details: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "robot rejected POST");
            return Err(TransportError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        debug!(url, status = status.as_u16(), bytes = payload.len(), "POST accepted");
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        destination: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected(TransportKind::Http));
        }
        if ctx.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        tokio::select! {
            _ = ctx.cancelled() => Err(TransportError::Cancelled),
            result = self.post(destination, payload) => result,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
