// crates/reverie-server/src/background/mod.rs
// Background workers

mod reconciler;

pub use reconciler::ReconcileWorker;

use crate::manager::MemoryManager;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawn the periodic reconciler. Send `true` on the returned channel to stop it.
pub fn spawn(manager: MemoryManager) -> (watch::Sender<bool>, JoinHandle<()>) {
    let interval = Duration::from_secs(manager.config().reconcile_interval_secs.max(1));
    spawn_with_interval(manager, interval)
}

pub fn spawn_with_interval(
    manager: MemoryManager,
    interval: Duration,
) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = ReconcileWorker::new(manager, interval, shutdown_rx);
    let handle = tokio::spawn(async move {
        worker.run().await;
    });
    (shutdown_tx, handle)
}
