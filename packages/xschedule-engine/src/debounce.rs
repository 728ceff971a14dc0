//! Debounced update scheduling
//!
//! A burst of N payload-driven mutations must produce one externally
//! visible notification, not N. Each request cancels the previously armed
//! emission and arms a new one a quiescence window later, so only the last
//! request in an unbroken burst fires.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Single-slot cancel-and-replace debouncer
#[derive(Debug)]
pub(crate) struct UpdateScheduler {
    window: Duration,
    pending: Option<JoinHandle<()>>,
}

impl UpdateScheduler {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    /// Arm `emit` to run one quiescence window from now, replacing any
    /// previously armed emission.
    ///
    /// The emit future itself is responsible for checking that its target
    /// still exists; teardown is checked at emission time, not scheduling
    /// time.
    pub(crate) fn schedule<F>(&mut self, emit: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }

        let window = self.window;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            emit.await;
        }));
    }

    /// Cancel any armed emission and wait for the slot to drain
    pub(crate) async fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
            let _ = pending.await;
        }
    }
}
