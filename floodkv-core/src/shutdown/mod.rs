//! Graceful shutdown coordinator
//!
//! One coordinator per store. Area loops and consumer tasks subscribe;
//! `shutdown()` broadcasts the signal and flips the state so late
//! subscribers and API calls can observe it synchronously.

use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Broadcast payload; carries no data, the signal is the message
#[derive(Debug, Clone, Copy)]
pub struct ShutdownSignal;

/// Lifecycle state of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
}

/// Graceful shutdown coordinator
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: AtomicU8,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

const STATE_RUNNING: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        ShutdownCoordinator { state: AtomicU8::new(STATE_RUNNING), shutdown_tx }
    }

    /// Subscribe to the shutdown broadcast
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Flip to shutting-down and notify every subscriber. Idempotent.
    pub fn shutdown(&self) {
        let prev = self.state.swap(STATE_SHUTTING_DOWN, Ordering::SeqCst);
        if prev == STATE_SHUTTING_DOWN {
            warn!("shutdown already in progress");
            return;
        }
        info!("initiating shutdown");
        // send fails only when nobody is listening, which is fine
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_SHUTTING_DOWN
    }

    pub fn state(&self) -> ShutdownState {
        if self.is_shutting_down() {
            ShutdownState::ShuttingDown
        } else {
            ShutdownState::Running
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_notifies_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        assert_eq!(coordinator.state(), ShutdownState::Running);

        coordinator.shutdown();
        assert!(coordinator.is_shutting_down());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();
        coordinator.shutdown();
        assert!(coordinator.is_shutting_down());
    }
}
