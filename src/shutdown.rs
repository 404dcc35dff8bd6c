//! Signal / lifetime controller.
//!
//! One [`Shutdown`] per scope (the whole session, or a single attachment).
//! Anything that must die together holds a [`StopHandle`] and selects on
//! [`StopHandle::stopped`]. SIGINT, SIGTERM, and fatal internal errors all
//! funnel into the same `stop()` call, so every pump observes exactly one
//! cancellation event.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Cancellation source. Cloning shares the same underlying event.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger the stop event. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the stop event has fired.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// A handle tasks can await on.
    pub fn handle(&self) -> StopHandle {
        StopHandle {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaitable view of a [`Shutdown`].
#[derive(Clone)]
pub struct StopHandle {
    rx: watch::Receiver<bool>,
}

impl StopHandle {
    /// Resolves once `stop()` has been called. If the [`Shutdown`] was
    /// dropped without stopping, resolves as well, since an orphaned task
    /// has nothing left to serve.
    pub async fn stopped(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Spawn the OS signal listener: SIGINT and SIGTERM both trigger `stop()`.
pub fn spawn_signal_listener(shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("could not register SIGTERM handler: {e}");
                        let _ = ctrl_c.await;
                        info!("received SIGINT, shutting down");
                        shutdown.stop();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received SIGINT, shutting down");
        }
        shutdown.stop();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_wakes_all_handles() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.handle();
        let mut b = shutdown.handle();

        let waiter = tokio::spawn(async move {
            a.stopped().await;
        });

        shutdown.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("handle woke up")
            .expect("task joined");
        assert!(b.is_stopped());
        // Already-stopped handles resolve immediately.
        tokio::time::timeout(Duration::from_millis(100), b.stopped())
            .await
            .expect("resolves without waiting");
    }

    #[tokio::test]
    async fn handle_resolves_when_source_is_dropped() {
        let shutdown = Shutdown::new();
        let mut handle = shutdown.handle();
        drop(shutdown);
        tokio::time::timeout(Duration::from_secs(1), handle.stopped())
            .await
            .expect("orphaned handle resolves");
    }
}
