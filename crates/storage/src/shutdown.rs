//! Lifetime handle for backend background tasks.

use tokio::sync::watch;

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the owning backend's background task exits.
pub(crate) struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl ShutdownGuard {
    pub(crate) fn new() -> (Self, watch::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        (Self { shutdown_tx }, shutdown_rx)
    }

    pub(crate) fn signal(&self) {
        // Best-effort; the receiver may already be gone.
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal();
    }
}
