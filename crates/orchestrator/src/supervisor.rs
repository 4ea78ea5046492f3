//! Process supervisor — the consumer side of the creation queue.
//!
//! Dequeues [`CreateProcessAction`]s, instantiates closing processes, tracks
//! them in the shared live-process set, and routes their terminal events back
//! into the registry callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

use autoclose_core::traits::VenueClient;
use autoclose_execution::pending::PendingCloseLedger;
use autoclose_execution::process::{ClosingProcess, ProcessEvent};

use crate::actions::CreateProcessAction;
use crate::registry::AssignmentRegistry;

/// Live closing processes, shared between the supervisor, the registry, and
/// the reconciliation loop.
pub type SharedProcessSet = Arc<RwLock<HashMap<String, ProcessHandle>>>;

/// Cheap cloneable view of one running closing process.
#[derive(Clone)]
pub struct ProcessHandle {
    pub process_id: String,
    /// `None` for legacy processes created without an assignment tag; those
    /// are only reachable through the deprecated proximity matching.
    pub fill_id: Option<String>,
    pub trading_pair: String,
    pub reference_price: Decimal,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl ProcessHandle {
    #[must_use]
    pub fn new(
        process_id: String,
        fill_id: Option<String>,
        trading_pair: String,
        reference_price: Decimal,
        running: Arc<AtomicBool>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            process_id,
            fill_id,
            trading_pair,
            reference_price,
            running,
            stop,
        }
    }

    /// Self-reported running flag of the underlying process.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests a cooperative stop; the process finishes with an unknown
    /// outcome.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

pub struct ProcessSupervisor {
    registry: Arc<AssignmentRegistry>,
    live: SharedProcessSet,
    venue: Arc<dyn VenueClient>,
    ledger: PendingCloseLedger,
    actions: mpsc::Receiver<CreateProcessAction>,
    events_tx: mpsc::Sender<ProcessEvent>,
    events_rx: mpsc::Receiver<ProcessEvent>,
    shutdown: Arc<Notify>,
    seq: AtomicU64,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(
        registry: Arc<AssignmentRegistry>,
        live: SharedProcessSet,
        venue: Arc<dyn VenueClient>,
        ledger: PendingCloseLedger,
        actions: mpsc::Receiver<CreateProcessAction>,
        shutdown: Arc<Notify>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            registry,
            live,
            venue,
            ledger,
            actions,
            events_tx,
            events_rx,
            shutdown,
            seq: AtomicU64::new(0),
        }
    }

    /// Consumes creation requests and process events until shut down or the
    /// creation queue closes.
    pub async fn run(mut self) {
        info!("Process supervisor started");
        loop {
            tokio::select! {
                action = self.actions.recv() => match action {
                    Some(action) => self.launch(action).await,
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.dispatch(event).await,
                () = self.shutdown.notified() => break,
            }
        }
        // Deliver terminal events that are already queued before exiting.
        while let Ok(event) = self.events_rx.try_recv() {
            self.dispatch(event).await;
        }
        info!("Process supervisor stopped");
    }

    async fn launch(&mut self, action: CreateProcessAction) {
        let config = action.process_config;
        let fill_id = config.fill_id.clone();

        let duplicate = self
            .live
            .read()
            .await
            .values()
            .any(|h| h.is_running() && h.fill_id.as_deref() == Some(fill_id.as_str()));
        if duplicate {
            warn!(
                %fill_id,
                "Creation request ignored, a live process already owns this assignment"
            );
            return;
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let process_id = format!("close-{fill_id}-{seq}");
        let process = ClosingProcess::new(
            process_id.clone(),
            config.clone(),
            self.venue.clone(),
            self.ledger.clone(),
            self.events_tx.clone(),
        );
        let handle = ProcessHandle::new(
            process_id.clone(),
            Some(fill_id.clone()),
            config.trading_pair.clone(),
            config.reference_price,
            process.running_flag(),
            process.stop_handle(),
        );

        self.live.write().await.insert(process_id.clone(), handle);
        self.registry
            .register_process(&fill_id, &process_id, config)
            .await;
        info!(
            %process_id,
            %fill_id,
            controller_id = %action.controller_id,
            "Spawned closing process"
        );
        tokio::spawn(process.run());
    }

    async fn dispatch(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Completed {
                process_id,
                outcome,
                reason,
            } => {
                debug!(%process_id, ?outcome, "Process completion event");
                self.registry
                    .on_process_completed(&process_id, outcome, reason)
                    .await;
                self.live.write().await.remove(&process_id);
            }
            ProcessEvent::Failed { process_id, error } => {
                self.registry.on_process_failed(&process_id, &error).await;
                self.live.write().await.remove(&process_id);
            }
        }
    }
}
