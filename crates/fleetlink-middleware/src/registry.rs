//! [`TransportRegistry`] – one live transport per [`TransportKind`].
//!
//! The registry owns an `Arc` to every registered transport, remembers
//! which kind is the default, and dispatches a send by kind.  It performs no
//! retries; a failed send is returned to the caller untouched.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use fleetlink_types::{RequestContext, TransportError, TransportKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::Transport;

/// Every individual failure observed by [`TransportRegistry::close_all`].
#[derive(Error, Debug)]
#[error("{} transport(s) failed to close: {}", .0.len(), describe(.0))]
pub struct CloseErrors(pub Vec<(TransportKind, TransportError)>);

fn describe(errors: &[(TransportKind, TransportError)]) -> String {
    errors
        .iter()
        .map(|(kind, e)| format!("{kind}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Central transport registry and send dispatcher.
///
/// Construct with [`TransportRegistry::new`], register transports, then call
/// [`TransportRegistry::send`].
pub struct TransportRegistry {
    transports: RwLock<HashMap<TransportKind, Arc<dyn Transport>>>,
    default_kind: RwLock<TransportKind>,
}

impl TransportRegistry {
    /// Create an empty registry whose default is `default_kind`.
    pub fn new(default_kind: TransportKind) -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
            default_kind: RwLock::new(default_kind),
        }
    }

    /// Register `transport` under `kind`.  Any previously registered
    /// transport of the same kind is replaced (and returned).
    pub fn register(
        &self,
        kind: TransportKind,
        transport: Arc<dyn Transport>,
    ) -> Option<Arc<dyn Transport>> {
        if transport.kind() != kind {
            warn!(
                registered_as = %kind,
                reports = %transport.kind(),
                "transport registered under a kind it does not report"
            );
        }
        info!(kind = %kind, "transport registered");
        self.write_transports().insert(kind, transport)
    }

    pub fn set_default(&self, kind: TransportKind) {
        *self
            .default_kind
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = kind;
    }

    pub fn default_kind(&self) -> TransportKind {
        *self
            .default_kind
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_registered(&self, kind: TransportKind) -> bool {
        self.read_transports().contains_key(&kind)
    }

    /// Registered kinds in a stable order.
    pub fn kinds(&self) -> Vec<TransportKind> {
        let mut kinds: Vec<_> = self.read_transports().keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// Send `payload` to `destination` over the transport registered as
    /// `kind`.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotRegistered`] when no transport of that kind was
    /// registered; otherwise whatever the transport returned.
    pub async fn send(
        &self,
        ctx: &RequestContext,
        kind: TransportKind,
        destination: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let transport = self
            .read_transports()
            .get(&kind)
            .cloned()
            .ok_or(TransportError::NotRegistered(kind))?;
        debug!(kind = %kind, destination, bytes = payload.len(), "dispatching payload");
        transport.send(ctx, destination, payload).await
    }

    /// Close every registered transport.  Individual failures are logged and
    /// returned together; one failure does not stop the others from closing.
    pub async fn close_all(&self) -> Result<(), CloseErrors> {
        let transports: Vec<(TransportKind, Arc<dyn Transport>)> = self
            .read_transports()
            .iter()
            .map(|(k, t)| (*k, Arc::clone(t)))
            .collect();

        let mut failures = Vec::new();
        for (kind, transport) in transports {
            match transport.close().await {
                Ok(()) => info!(kind = %kind, "transport closed"),
                Err(e) => {
                    warn!(kind = %kind, error = %e, "transport failed to close");
                    failures.push((kind, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CloseErrors(failures))
        }
    }

    fn read_transports(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<TransportKind, Arc<dyn Transport>>> {
        self.transports
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_transports(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<TransportKind, Arc<dyn Transport>>> {
        self.transports
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new(TransportKind::Queue)
    }
}
