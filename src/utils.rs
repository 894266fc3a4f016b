use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::select;
use tokio::task::JoinHandle;
use tracing::error;

/// Spawns a future that will retry on failure with a backoff duration.
///
/// The future will retry until it succeeds or a shutdown signal is
/// received. During a shutdown the task is cancelled at its next await
/// point; the loops spawned this way are tick-driven and safe to cancel.
pub fn spawn_with_backoff<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutdown: crate::shutdown::Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let shutting_down = AtomicBool::new(false);
        select! {
            () = retry_future(future_spawner, backoff_duration, &shutting_down) => {},
            () = async {
                shutdown.await_shutdown_begin().await;
                shutting_down.store(true, Ordering::SeqCst);
            } => {},
        }
    })
}

async fn retry_future<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutting_down: &AtomicBool,
) where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    loop {
        let future = future_spawner();

        // Wrap in `AssertUnwindSafe` so we can call `catch_unwind` on it.
        let future = std::panic::AssertUnwindSafe(future);

        match future.catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                error!("Task failed: {e:?}");
            }
            Err(e) => {
                error!("Task panicked: {e:?}");
            }
        }

        if shutting_down.load(Ordering::SeqCst) {
            return;
        }

        tokio::time::sleep(backoff_duration).await;
    }
}
