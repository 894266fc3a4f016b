use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

struct Inner {
    sender: watch::Sender<bool>,
    timeout: Duration,
    delay: Duration,
}

/// Cloneable handle used to begin and observe a graceful shutdown.
///
/// Every long-running task holds a clone and selects on
/// [`Shutdown::await_shutdown_begin`]. The handle also carries the grace
/// parameters the binary uses when tearing the task tree down.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    #[must_use]
    pub fn new(timeout: Duration, delay: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                sender,
                timeout,
                delay,
            }),
        }
    }

    /// Create a handle and install SIGINT/SIGTERM listeners that trigger it.
    #[must_use]
    pub fn spawn(timeout: Duration, delay: Duration) -> Self {
        let shutdown = Self::new(timeout, delay);
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(error) = signal_shutdown().await {
                    tracing::error!(?error, "Error listening for shutdown signals");
                }
                shutdown.shutdown();
            }
        });
        shutdown
    }

    /// Signal all holders that a shutdown has begun.
    pub fn shutdown(&self) {
        // Send only fails when every receiver is gone, in which case there
        // is nobody left to notify.
        _ = self.inner.sender.send(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.sender.borrow()
    }

    /// Resolves once a shutdown has been signalled. Resolves immediately
    /// if one is already in progress. Safe to cancel by dropping.
    pub async fn await_shutdown_begin(&self) {
        let mut watch = self.inner.sender.subscribe();
        if *watch.borrow_and_update() {
            return;
        }
        // The sender lives as long as this handle, so the channel cannot
        // close under us.
        watch.changed().await.unwrap();
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.inner.delay
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("is_shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(unix)]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;
    tokio::pin!(sigint);
    tokio::pin!(sigterm);
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::ctrl_c;

    ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}
