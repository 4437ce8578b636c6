//! Background backend reachability checks

use crate::llm::ChatTransport;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Last observed backend reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Unknown,
    Online,
    Offline,
}

/// Polls the backend on an interval and publishes the result
pub struct ConnectionMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionMonitor {
    pub fn spawn(transport: Arc<dyn ChatTransport>, interval: Duration) -> Self {
        let (status_tx, status) = watch::channel(ConnectionStatus::Unknown);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            tracing::info!(endpoint = %transport.endpoint(), "Starting connection monitor");
            loop {
                let reachable = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    result = transport.list_models() => result.is_ok(),
                };

                let status = if reachable {
                    ConnectionStatus::Online
                } else {
                    ConnectionStatus::Offline
                };
                let previous = status_tx.send_replace(status);
                if previous != status {
                    tracing::info!(
                        endpoint = %transport.endpoint(),
                        status = ?status,
                        "Backend connection status changed"
                    );
                }

                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!("Connection monitor stopped");
        });

        Self {
            cancel,
            handle,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stop polling and wait for the task to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Connection monitor ended abnormally");
        }
    }
}
