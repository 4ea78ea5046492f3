//! Wiring — builds the registry, ingestor, supervisor, and reconciliation
//! loop as one unit and owns their background tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

use autoclose_core::config::AssignmentConfig;
use autoclose_core::events::AssignmentFillEvent;
use autoclose_core::traits::VenueClient;
use autoclose_execution::pending::PendingCloseLedger;

use crate::ingestion::AssignmentIngestor;
use crate::reconciler::ReconciliationLoop;
use crate::registry::AssignmentRegistry;
use crate::supervisor::{ProcessSupervisor, SharedProcessSet};

pub struct AssignmentService {
    registry: Arc<AssignmentRegistry>,
    ingestor: AssignmentIngestor,
    live: SharedProcessSet,
    reconciler_stop: Arc<AtomicBool>,
    supervisor_shutdown: Arc<Notify>,
    supervisor_task: JoinHandle<()>,
    reconciler_task: JoinHandle<()>,
}

impl AssignmentService {
    /// Validates the configuration, wires the components, and spawns the
    /// supervisor and reconciliation tasks.
    ///
    /// # Errors
    /// Returns an error if the configuration fails validation.
    pub fn start(config: AssignmentConfig, venue: Arc<dyn VenueClient>) -> Result<Self> {
        config.validate()?;

        let live: SharedProcessSet = Arc::new(RwLock::new(HashMap::new()));
        let (action_tx, action_rx) = mpsc::channel(32);
        let registry = Arc::new(AssignmentRegistry::new(
            config.clone(),
            venue.clone(),
            live.clone(),
            action_tx,
        ));
        let ingestor = AssignmentIngestor::new(registry.clone());

        let supervisor_shutdown = Arc::new(Notify::new());
        let supervisor = ProcessSupervisor::new(
            registry.clone(),
            live.clone(),
            venue,
            PendingCloseLedger::new(),
            action_rx,
            supervisor_shutdown.clone(),
        );
        let supervisor_task = tokio::spawn(supervisor.run());

        let reconciler = ReconciliationLoop::new(
            registry.clone(),
            live.clone(),
            Duration::from_secs(config.reconcile_interval_secs),
        );
        let reconciler_stop = reconciler.stop_handle();
        let reconciler_task = tokio::spawn(reconciler.run());

        info!(connector_id = %config.connector_id, "Assignment service started");
        Ok(Self {
            registry,
            ingestor,
            live,
            reconciler_stop,
            supervisor_shutdown,
            supervisor_task,
            reconciler_task,
        })
    }

    #[must_use]
    pub fn registry(&self) -> Arc<AssignmentRegistry> {
        self.registry.clone()
    }

    /// Entry point for the connector's assignment notifications.
    pub fn on_assignment_notification(&self, event: AssignmentFillEvent) {
        self.ingestor.on_assignment_notification(event);
    }

    pub async fn status_report(&self) -> String {
        self.registry.status_report().await
    }

    /// Cooperative shutdown: stops the reconciliation loop, requests a stop
    /// from every closing process, and winds down the supervisor.
    pub async fn shutdown(self) {
        self.reconciler_stop.store(true, Ordering::SeqCst);
        for handle in self.live.read().await.values() {
            handle.request_stop();
        }
        let _ = self.reconciler_task.await;
        self.supervisor_shutdown.notify_one();
        let _ = self.supervisor_task.await;
        info!("Assignment service stopped");
    }
}
