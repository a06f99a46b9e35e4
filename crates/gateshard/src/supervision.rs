use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;

/// Spawn a supervised task. A panic inside the task is fatal to the whole
/// process: supervisors hold sessions and directory state that no other
/// task can recover, so the process exits and an external supervisor
/// restarts it.
pub(crate) fn spawn_supervised<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(task = name, panic = %message, "supervised task panicked, aborting");
            std::process::abort();
        }
    })
}
