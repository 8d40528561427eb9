// crates/reverie-server/src/background/reconciler.rs
// Periodic index/transcript reconciliation

use crate::manager::MemoryManager;
use std::time::Duration;
use tokio::sync::watch;

/// Reconciles every known chat on a fixed interval
pub struct ReconcileWorker {
    manager: MemoryManager,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ReconcileWorker {
    pub fn new(manager: MemoryManager, interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            manager,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Reconcile worker started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = self.shutdown.changed() => {
                    // Sender dropped counts as shutdown
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if *self.shutdown.borrow() {
                break;
            }
            self.tick().await;
        }
        tracing::info!("Reconcile worker shutting down");
    }

    /// One pass over every chat; returns how many needed repair
    pub async fn tick(&self) -> usize {
        let reports = self.manager.reconcile_all().await;
        let repaired = reports.iter().filter(|r| !r.is_consistent()).count();
        if repaired > 0 {
            tracing::info!(chats = reports.len(), repaired, "Reconcile pass repaired drift");
        } else {
            tracing::debug!(chats = reports.len(), "Reconcile pass clean");
        }
        repaired
    }
}
