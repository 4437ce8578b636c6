//! Ownership handle for the running stream task

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The one background stream a session may have in flight
pub(crate) struct StreamTask {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StreamTask {
    pub fn new(id: u64, cancel: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self { id, cancel, handle }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the task to stop at its next suspension point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to terminate
    pub async fn join(self) {
        match self.handle.await {
            Ok(()) => tracing::debug!(stream_id = self.id, "Stream task finished"),
            Err(e) if e.is_panic() => {
                tracing::error!(stream_id = self.id, error = %e, "Stream task panicked");
            }
            Err(e) => tracing::warn!(stream_id = self.id, error = %e, "Stream task aborted"),
        }
    }
}
