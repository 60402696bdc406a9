//! Owned background tasks.
//!
//! A [`TaskHandle`] owns a spawned loop and the broadcast channel that tells
//! it to stop. Dropping the handle without calling [`TaskHandle::stop`]
//! aborts the task.

use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a running background loop.
pub struct TaskHandle {
    name: &'static str,
    shutdown_tx: broadcast::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn `body`, handing it the shutdown receiver it must watch.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let join = tokio::spawn(body(shutdown_rx));
        debug!("Started background task {}", name);
        Self { name, shutdown_tx, join: Some(join) }
    }

    /// Task name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                if !e.is_cancelled() {
                    warn!("Background task {} ended abnormally: {}", self.name, e);
                }
            }
        }
        debug!("Stopped background task {}", self.name);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}
