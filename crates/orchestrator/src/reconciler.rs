//! Reconciliation loop — periodic drift repair between the registry and the
//! live set of closing processes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::registry::AssignmentRegistry;
use crate::supervisor::SharedProcessSet;

pub struct ReconciliationLoop {
    registry: Arc<AssignmentRegistry>,
    live: SharedProcessSet,
    interval: Duration,
    should_stop: Arc<AtomicBool>,
}

impl ReconciliationLoop {
    #[must_use]
    pub fn new(
        registry: Arc<AssignmentRegistry>,
        live: SharedProcessSet,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            live,
            interval,
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative stop flag, checked at the sleep boundary.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.should_stop.clone()
    }

    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Reconciliation loop started"
        );
        loop {
            if self.should_stop.load(Ordering::SeqCst) {
                break;
            }
            self.tick().await;
            tokio::time::sleep(self.interval).await;
            if self.should_stop.load(Ordering::SeqCst) {
                break;
            }
        }
        info!("Reconciliation loop stopped");
    }

    /// One reconciliation pass. Each repair is individually atomic per
    /// assignment; a failure in one never aborts the others.
    pub async fn tick(&self) {
        // 1. Enumerate live processes, partitioned by their self-reported
        //    running flag. Both partitions resolve a process reference.
        let known: HashSet<String> = {
            let live = self.live.read().await;
            let active = live.values().filter(|h| h.is_running()).count();
            debug!(
                active,
                completed = live.len() - active,
                "Reconciliation tick"
            );
            live.keys().cloned().collect()
        };

        // 2. Clear references no enumerated process resolves (grace-gated).
        self.registry.repair_stale_references(&known).await;

        // 3. Backfill or create processes for uncovered assignments.
        self.registry.ensure_processes().await;

        // 4. Rate-limited internally; safe to call every tick.
        self.registry.garbage_collect(false).await;
    }
}
