//! Graceful shutdown coordinator
//!
//! The CLI's run loop and the node reboot loop both select on
//! [`ShutdownCoordinator::wait_for_shutdown`]; SIGINT/SIGTERM trigger it.

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

pub struct ShutdownCoordinator {
    state: RwLock<ShutdownState>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            state: RwLock::new(ShutdownState::Running),
            shutdown_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Ask every component to stop. A second request escalates to
    /// [`ShutdownSignal::Immediate`].
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        let signal = match *state {
            ShutdownState::Running => {
                info!("Initiating graceful shutdown");
                *state = ShutdownState::ShuttingDown;
                ShutdownSignal::Graceful
            }
            _ => {
                warn!("Shutdown already in progress, escalating");
                *state = ShutdownState::Shutdown;
                ShutdownSignal::Immediate
            }
        };
        drop(state);

        if self.shutdown_tx.send(signal).is_err() {
            // Nobody is listening yet; the state change is still visible.
            info!("No shutdown subscribers");
        }
    }

    /// Record that every component has stopped.
    pub async fn complete(&self) {
        *self.state.write().await = ShutdownState::Shutdown;
        info!("Shutdown complete");
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.state.read().await != ShutdownState::Running
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    /// Resolve once shutdown has been requested, even if that happened
    /// before the call.
    pub async fn wait_for_shutdown(&self) -> ShutdownSignal {
        let mut rx = self.subscribe();
        match *self.state.read().await {
            ShutdownState::Running => {}
            ShutdownState::ShuttingDown => return ShutdownSignal::Graceful,
            ShutdownState::Shutdown => return ShutdownSignal::Immediate,
        }
        rx.recv().await.unwrap_or(ShutdownSignal::Immediate)
    }
}

/// Forward SIGINT/SIGTERM to the coordinator for the life of the process.
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
            coordinator.shutdown().await;
        }
    });
}

#[cfg(windows)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            coordinator.shutdown().await;
        }
        error!("Failed to listen for Ctrl+C");
    });
}
