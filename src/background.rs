//! Fire-and-forget background work
//!
//! Memory creation, persona updates, and time estimation run after the
//! caller has its result. Their failures are logged and never reach the
//! code path that spawned them.

use std::future::Future;

use tokio::task::JoinHandle;

use crate::Result;

/// Spawner for unsupervised tasks
#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundTasks;

impl BackgroundTasks {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Run `fut` detached; an `Err` result is logged under `name`
    ///
    /// A panic is logged as well when panics unwind. Release builds abort
    /// on panic, so there it takes the process down. The handle is
    /// returned for tests. Production callers drop it.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let inner = tokio::spawn(fut);
        tokio::spawn(async move {
            match inner.await {
                Ok(Ok(())) => tracing::debug!(task = name, "background task finished"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "background task failed"),
                Err(e) => tracing::warn!(task = name, error = %e, "background task panicked"),
            }
        })
    }
}
