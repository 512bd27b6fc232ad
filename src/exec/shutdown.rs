//! Process-wide shutdown notice
//!
//! SIGINT and SIGTERM are caught once, in `main`, by [`Shutdown::listen`].
//! Every guarded wait holds a clone and stops its command when the notice
//! fires. A batch (plugins, jails) sees the resulting
//! [`TimeoutError::Interrupted`](super::TimeoutError::Interrupted) and aborts
//! instead of moving on to the next item.

use std::io;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// A notice that only fires through [`trigger`](Self::trigger)
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Catch SIGINT and SIGTERM for the rest of the process lifetime
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen() -> io::Result<Self> {
        let shutdown = Self::new();
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;

        let notice = shutdown.clone();
        tokio::spawn(async move {
            let name = tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
            };
            warn!("Received {}, shutting down", name);
            notice.trigger();
        });
        Ok(shutdown)
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the notice has fired, immediately if it already has
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|&fired| fired).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time;

    #[tokio::test]
    async fn test_wait_after_trigger_returns() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        assert!(shutdown.is_triggered());
        time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_the_notice() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        shutdown.trigger();
        time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_untriggered_wait_stays_pending() {
        let shutdown = Shutdown::new();
        let waited = time::timeout(Duration::from_millis(100), shutdown.wait()).await;
        assert!(waited.is_err());
    }
}
