//! Graceful shutdown.
//!
//! On SIGTERM/SIGINT: stop admitting calls, let in-flight sessions reach
//! their next safe boundary, then release the HTTP listener. A hard cap
//! bounds the whole drain.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use callbridge_config::constants::shutdown;
use callbridge_telephony::CallOrchestrator;

/// Coordinates the drain across components.
pub struct ShutdownCoordinator {
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { shutdown_tx }
    }

    /// Sessions watch this to stop at their next TTS segment boundary.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Begin the drain: gate admission, signal sessions, wait for the
    /// active-call map to empty, hard-capped.
    pub async fn drain(&self, orchestrator: &Arc<CallOrchestrator>) {
        orchestrator.stop_accepting();
        let _ = self.shutdown_tx.send(true);

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(shutdown::HARD_CAP_SECS);
        loop {
            let active = orchestrator.active_count();
            if active == 0 {
                tracing::info!("All sessions drained");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(active, "Shutdown hard cap reached with sessions active");
                return;
            }
            tracing::info!(active, "Waiting for sessions to drain");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve when SIGTERM or Ctrl+C arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_the_flag() {
        let coordinator = ShutdownCoordinator::new();
        let rx = coordinator.subscribe();
        assert!(!*rx.borrow());
        let _ = coordinator.shutdown_tx.send(true);
        assert!(*rx.borrow());
        assert!(coordinator.is_shutting_down());
    }
}
