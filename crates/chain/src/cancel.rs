//! Cooperative cancellation for refresh and monitor cycles.

use std::sync::Arc;
use tokio::sync::watch;

/// Owner side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Cloneable receiver side, passed into every refresh.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    /// Keeps the channel open for signals that have no handle.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl CancelHandle {
    /// Create a new handle and its first signal.
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        let signal = CancelSignal {
            rx,
            _keepalive: None,
        };
        (Self { tx: Arc::new(tx) }, signal)
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Derive another signal from this handle.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested.
    ///
    /// Also resolves if the owning handle is dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Err means the sender is gone; treat as cancelled.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
