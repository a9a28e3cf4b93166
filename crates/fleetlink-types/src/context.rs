//! Cooperative cancellation threaded through every transport send.

use tokio::sync::watch;

/// Ambient request context.
///
/// Cloning is cheap; all clones observe the same cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: Option<watch::Receiver<bool>>,
}

/// The sending half of a [`RequestContext`] created with
/// [`RequestContext::with_cancel`].
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl RequestContext {
    /// A context that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// A cancellable context and the handle that cancels it.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { cancel: Some(rx) }, CancelHandle(tx))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the context is cancelled.  Never resolves for a
    /// background context or when the handle was dropped uncancelled.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.cancel else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}
