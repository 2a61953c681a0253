//! Graceful-shutdown coordination.
//!
//! A single [`ShutdownSignal`] is shared by everything that needs to wind
//! down: the HTTP server's graceful-shutdown future and each worker's
//! consume loop. Once triggered (by SIGTERM/SIGINT or programmatically in
//! tests) every subscriber observes it; workers finish their in-flight
//! entry and exit within the drain deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a receiver that resolves once shutdown is triggered.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Non-blocking check, used at the top of each worker cycle.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger shutdown programmatically.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }

    /// Block until SIGTERM or SIGINT arrives, then notify all subscribers.
    pub async fn listen_for_signals(&self) {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("failed to register SIGINT handler");

        tokio::select! {
            _ = term.recv() => info!("received SIGTERM, shutting down gracefully"),
            _ = interrupt.recv() => info!("received SIGINT, shutting down gracefully"),
        };

        self.trigger();
    }

    /// Future form of [`ShutdownSignal::subscribe`] for
    /// `with_graceful_shutdown` and `tokio::select!` arms.
    pub async fn cancelled(&self) {
        let mut receiver = self.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = receiver.recv().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_reaches_every_subscriber() {
        let signal = ShutdownSignal::new();
        let mut first = signal.subscribe();
        let mut second = signal.clone().subscribe();

        signal.trigger();

        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn cancelled_resolves_for_late_subscribers() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        // Subscribing after the trigger still observes shutdown.
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .expect("cancelled() should resolve after trigger");
    }

    #[tokio::test]
    async fn untriggered_signal_reports_not_triggered() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
    }
}
