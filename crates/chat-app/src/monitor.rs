use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cortex_llm::GenerateBackend;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Checking,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        formatter.write_str(label)
    }
}

/// Backend reachability, probed on demand.
pub struct ConnectionMonitor {
    backend: Arc<dyn GenerateBackend>,
    timeout: Duration,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl ConnectionMonitor {
    pub fn new(backend: Arc<dyn GenerateBackend>, timeout: Duration) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            backend,
            timeout,
            status_tx,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub async fn check_status(&self) -> ConnectionStatus {
        self.status_tx.send_replace(ConnectionStatus::Checking);

        let status = match self.backend.check_reachable(self.timeout).await {
            Ok(()) => ConnectionStatus::Connected,
            Err(error) => {
                tracing::warn!(
                    backend = %self.backend.id(),
                    error = %error,
                    "backend reachability probe failed"
                );
                ConnectionStatus::Disconnected
            }
        };

        self.status_tx.send_replace(status);
        status
    }
}
