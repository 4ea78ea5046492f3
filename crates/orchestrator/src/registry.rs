//! Assignment registry — durable in-memory bookkeeping for assignments and
//! their closing processes.
//!
//! The registry is an injected, explicitly-owned object; admission of new
//! assignments is serialized by a single lock rather than per-fill locking,
//! trading throughput for correctness — admission is rare next to
//! steady-state ticking. Nothing here holds two locks at once; the admission
//! mutex is the outer serializer for every check-then-act sequence.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use autoclose_core::config::AssignmentConfig;
use autoclose_core::events::AssignmentFillEvent;
use autoclose_core::traits::VenueClient;
use autoclose_execution::process::{ClosingConfig, ProcessOutcome};

use crate::actions::CreateProcessAction;
use crate::records::{
    is_placeholder, placeholder_process_id, AssignmentRecord, AssignmentStatus,
    ClosingProcessRecord, ProcessRecordStatus,
};
use crate::supervisor::{ProcessHandle, SharedProcessSet};

pub struct AssignmentRegistry {
    config: AssignmentConfig,
    venue: Arc<dyn VenueClient>,
    assignments: RwLock<HashMap<String, AssignmentRecord>>,
    processes: RwLock<HashMap<String, ClosingProcessRecord>>,
    /// Serializes assignment admission and process linkage.
    admission: Mutex<()>,
    live: SharedProcessSet,
    actions: mpsc::Sender<CreateProcessAction>,
    last_gc: StdMutex<Option<Instant>>,
}

impl AssignmentRegistry {
    #[must_use]
    pub fn new(
        config: AssignmentConfig,
        venue: Arc<dyn VenueClient>,
        live: SharedProcessSet,
        actions: mpsc::Sender<CreateProcessAction>,
    ) -> Self {
        Self {
            config,
            venue,
            assignments: RwLock::new(HashMap::new()),
            processes: RwLock::new(HashMap::new()),
            admission: Mutex::new(()),
            live,
            actions,
            last_gc: StdMutex::new(None),
        }
    }

    /// Admits an assignment event: creates the record and requests process
    /// creation atomically with respect to concurrent duplicate events.
    ///
    /// Returns `true` when a new record was created.
    pub async fn admit_assignment(&self, event: AssignmentFillEvent) -> bool {
        let _admission = self.admission.lock().await;

        if self.assignments.read().await.contains_key(&event.fill_id) {
            debug!(fill_id = %event.fill_id, "Duplicate assignment event discarded");
            return false;
        }
        if event.amount <= Decimal::ZERO {
            warn!(
                fill_id = %event.fill_id,
                amount = %event.amount,
                "Malformed assignment event discarded"
            );
            return false;
        }
        if !self.pair_accepted(&event.trading_pair) {
            warn!(
                fill_id = %event.fill_id,
                trading_pair = %event.trading_pair,
                "Assignment on an untracked pair discarded"
            );
            return false;
        }

        let record = AssignmentRecord::new(&event);
        self.assignments
            .write()
            .await
            .insert(event.fill_id.clone(), record);
        info!(
            fill_id = %event.fill_id,
            trading_pair = %event.trading_pair,
            side = ?event.position_side,
            amount = %event.amount,
            "Assignment recorded"
        );

        self.request_creation_locked(&event.fill_id).await;
        true
    }

    /// Whether a new closing process may be created for this assignment.
    #[must_use]
    pub async fn can_create_process(&self, fill_id: &str) -> bool {
        let _admission = self.admission.lock().await;
        self.can_create_locked(fill_id).await
    }

    /// Requests creation of a closing process for the assignment, if one may
    /// be created.
    pub async fn request_creation(&self, fill_id: &str) {
        let _admission = self.admission.lock().await;
        self.request_creation_locked(fill_id).await;
    }

    async fn can_create_locked(&self, fill_id: &str) -> bool {
        let Some((status, linked)) = self
            .assignments
            .read()
            .await
            .get(fill_id)
            .map(|r| (r.status, r.closing_process_id.clone()))
        else {
            debug!(%fill_id, "Unknown fill id, no process to create");
            return false;
        };
        if status == AssignmentStatus::Closed {
            return false;
        }
        if linked.is_some() {
            return false;
        }
        if let Some(process_id) = self.find_live_process_exact(fill_id).await {
            // Repair our own bookkeeping before refusing.
            if let Some(record) = self.assignments.write().await.get_mut(fill_id) {
                record.link_process(process_id.clone());
            }
            warn!(
                %fill_id,
                %process_id,
                "Backfilled missing process reference from a live process"
            );
            return false;
        }
        true
    }

    async fn request_creation_locked(&self, fill_id: &str) {
        if !self.can_create_locked(fill_id).await {
            return;
        }
        let Some(record) = self.assignments.read().await.get(fill_id).cloned() else {
            return;
        };
        let process_config = ClosingConfig::for_assignment(
            &self.config,
            fill_id,
            &record.trading_pair,
            record.position_side,
            record.amount,
            record.reference_price,
        );
        let action = CreateProcessAction {
            controller_id: self.config.connector_id.clone(),
            process_config,
        };
        match self.actions.try_send(action) {
            Ok(()) => {
                // Optimistic placeholder until the supervisor reports the
                // real process id.
                if let Some(record) = self.assignments.write().await.get_mut(fill_id) {
                    record.link_process(placeholder_process_id(fill_id));
                }
                debug!(%fill_id, "Closing process creation requested");
            }
            Err(e) => {
                // Record stays EXECUTING with no reference; the
                // reconciliation loop retries.
                error!(%fill_id, error = %e, "Failed to enqueue process creation request");
            }
        }
    }

    /// Associates a process with an assignment. Idempotent; a different
    /// process id overwrites only when the previous process is confirmed
    /// dead.
    pub async fn register_process(&self, fill_id: &str, process_id: &str, config: ClosingConfig) {
        let _admission = self.admission.lock().await;

        let linked = self
            .assignments
            .read()
            .await
            .get(fill_id)
            .map(|r| r.closing_process_id.clone());
        match linked {
            None => warn!(
                %fill_id,
                %process_id,
                "Registering a process for an unknown assignment"
            ),
            Some(existing) => {
                let overwrite = match existing {
                    Some(ref current) if current == process_id => false,
                    Some(ref current) if is_placeholder(current) => true,
                    Some(ref current) => {
                        let alive = self
                            .live
                            .read()
                            .await
                            .get(current)
                            .is_some_and(ProcessHandle::is_running);
                        if alive {
                            warn!(
                                %fill_id,
                                existing = %current,
                                %process_id,
                                "Assignment already linked to a live process, keeping the existing link"
                            );
                            false
                        } else {
                            true
                        }
                    }
                    None => true,
                };
                if overwrite {
                    if let Some(record) = self.assignments.write().await.get_mut(fill_id) {
                        record.link_process(process_id.to_string());
                    }
                }
            }
        }

        self.processes
            .write()
            .await
            .entry(process_id.to_string())
            .or_insert_with(|| ClosingProcessRecord::new(process_id, config));
    }

    /// Terminal callback from the supervisor. `Unknown` closes the process
    /// bookkeeping without asserting a business outcome on the assignment.
    pub async fn on_process_completed(
        &self,
        process_id: &str,
        outcome: ProcessOutcome,
        reason: Option<String>,
    ) {
        let fill_id = {
            let mut processes = self.processes.write().await;
            let Some(record) = processes.get_mut(process_id) else {
                warn!(%process_id, "Completion callback for an unknown process");
                return;
            };
            record.status = match outcome {
                ProcessOutcome::Failure => ProcessRecordStatus::Failed,
                ProcessOutcome::Success | ProcessOutcome::Unknown => ProcessRecordStatus::Completed,
            };
            record.terminal_at = Some(Instant::now());
            record.fill_id.clone()
        };

        match outcome {
            ProcessOutcome::Success => {
                self.mark_assignment(&fill_id, AssignmentStatus::Closed, None)
                    .await;
            }
            ProcessOutcome::Failure => {
                self.mark_assignment(&fill_id, AssignmentStatus::Failed, reason)
                    .await;
            }
            ProcessOutcome::Unknown => {
                warn!(
                    %process_id,
                    %fill_id,
                    ?reason,
                    "Process ended without a known outcome, assignment left as-is"
                );
            }
        }
    }

    /// Failure callback. Recent failures are retained for operator
    /// inspection; stale ones are removed immediately together with the
    /// process record.
    pub async fn on_process_failed(&self, process_id: &str, error_text: &str) {
        let resolved = {
            let mut processes = self.processes.write().await;
            processes.get_mut(process_id).map(|record| {
                record.status = ProcessRecordStatus::Failed;
                let failed_at = *record.terminal_at.get_or_insert_with(Instant::now);
                (record.fill_id.clone(), failed_at)
            })
        };
        let Some((fill_id, failed_at)) = resolved else {
            warn!(%process_id, "Failure callback for an unknown process");
            return;
        };
        error!(%process_id, %fill_id, error = error_text, "Closing process failed");

        // Resolve optimistic placeholder references still waiting on this
        // process — covers the race between placeholder assignment and the
        // asynchronous registration that never happened.
        {
            let placeholder = placeholder_process_id(&fill_id);
            let mut assignments = self.assignments.write().await;
            for record in assignments.values_mut() {
                if record.closing_process_id.as_deref() == Some(placeholder.as_str())
                    && !record.status.is_terminal()
                {
                    record.status = AssignmentStatus::Failed;
                    record.error = Some(error_text.to_string());
                    record.terminal_at = Some(Instant::now());
                    record.link_process(process_id.to_string());
                    warn!(
                        fill_id = %record.fill_id,
                        %process_id,
                        "Resolved placeholder reference to a failed process"
                    );
                }
            }
        }

        self.mark_assignment(&fill_id, AssignmentStatus::Failed, Some(error_text.to_string()))
            .await;

        if failed_at.elapsed() >= self.failure_inspection() {
            self.assignments.write().await.remove(&fill_id);
            self.processes.write().await.remove(process_id);
            info!(%fill_id, %process_id, "Stale failure removed immediately");
        }
    }

    /// Step 2 of the reconciliation tick: clear process references that no
    /// enumerated process resolves, once past the grace window.
    pub async fn repair_stale_references(&self, known_processes: &HashSet<String>) {
        let _admission = self.admission.lock().await;
        let grace = self.missing_process_grace();
        let mut assignments = self.assignments.write().await;
        for record in assignments.values_mut() {
            if record.status.is_terminal() {
                continue;
            }
            let Some(process_id) = record.closing_process_id.clone() else {
                continue;
            };
            if known_processes.contains(&process_id) {
                continue;
            }
            let unresolved_for = record
                .process_linked_at
                .map_or(Duration::MAX, |at| at.elapsed());
            if unresolved_for < grace {
                // Tolerates the startup/propagation race.
                continue;
            }
            warn!(
                fill_id = %record.fill_id,
                %process_id,
                "Clearing stale process reference"
            );
            record.clear_process();
        }
    }

    /// Step 3 of the reconciliation tick: every assignment without a process
    /// gets one backfilled from the live set or freshly requested.
    pub async fn ensure_processes(&self) {
        let candidates: Vec<String> = self
            .assignments
            .read()
            .await
            .values()
            .filter(|r| r.closing_process_id.is_none() && r.status != AssignmentStatus::Closed)
            .map(|r| r.fill_id.clone())
            .collect();

        for fill_id in candidates {
            // Per-assignment atomicity: lock, repair, release.
            let _admission = self.admission.lock().await;
            if let Some(process_id) = self.find_live_process_exact(&fill_id).await {
                if let Some(record) = self.assignments.write().await.get_mut(&fill_id) {
                    record.link_process(process_id.clone());
                }
                info!(%fill_id, %process_id, "Backfilled process reference");
                continue;
            }
            if self.config.legacy_proximity_match {
                if let Some(process_id) = self.find_live_process_by_proximity(&fill_id).await {
                    if let Some(record) = self.assignments.write().await.get_mut(&fill_id) {
                        record.link_process(process_id.clone());
                    }
                    warn!(
                        %fill_id,
                        %process_id,
                        "Matched untagged process by price proximity (deprecated path)"
                    );
                    continue;
                }
            }
            self.request_creation_locked(&fill_id).await;
        }
    }

    /// Rate-limited cleanup of terminal and orphaned records.
    pub async fn garbage_collect(&self, force: bool) {
        {
            let mut last = self.last_gc.lock().unwrap_or_else(PoisonError::into_inner);
            if !force {
                if let Some(at) = *last {
                    if at.elapsed() < self.gc_min_interval() {
                        return;
                    }
                }
            }
            *last = Some(Instant::now());
        }

        let terminal_retention = self.terminal_retention();
        let orphan_retention = self.orphan_retention();
        let process_ids: HashSet<String> = self.processes.read().await.keys().cloned().collect();
        let live_running: HashSet<String> = self
            .live
            .read()
            .await
            .iter()
            .filter(|(_, handle)| handle.is_running())
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0usize;
        {
            let mut assignments = self.assignments.write().await;
            assignments.retain(|fill_id, record| {
                if !record.status.is_terminal() {
                    return true;
                }
                // Never delete out from under a still-active process.
                if record
                    .closing_process_id
                    .as_ref()
                    .is_some_and(|pid| live_running.contains(pid))
                {
                    return true;
                }
                let process_gone = record
                    .closing_process_id
                    .as_ref()
                    .map_or(true, |pid| is_placeholder(pid) || !process_ids.contains(pid));
                let age = record.terminal_at.unwrap_or(record.received_at).elapsed();
                if process_gone || age >= terminal_retention {
                    debug!(%fill_id, status = ?record.status, "Assignment record collected");
                    removed += 1;
                    return false;
                }
                true
            });
        }

        let remaining_fills: HashSet<String> =
            self.assignments.read().await.keys().cloned().collect();
        {
            let mut processes = self.processes.write().await;
            processes.retain(|process_id, record| {
                if live_running.contains(process_id) {
                    return true;
                }
                let age = record.terminal_at.unwrap_or(record.created_at).elapsed();
                let orphaned = !remaining_fills.contains(&record.fill_id);
                if orphaned && age >= orphan_retention {
                    debug!(%process_id, "Orphaned process record collected");
                    removed += 1;
                    return false;
                }
                if record.status.is_terminal() && age >= terminal_retention {
                    debug!(%process_id, "Terminal process record collected");
                    removed += 1;
                    return false;
                }
                true
            });
        }

        if removed > 0 {
            info!(removed, "Garbage collection pass finished");
        }
    }

    /// Human-readable summary for operational dashboards. Not part of the
    /// correctness contract.
    pub async fn status_report(&self) -> String {
        let assignments = self.assignments.read().await;
        let active = self
            .live
            .read()
            .await
            .values()
            .filter(|h| h.is_running())
            .count();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Assignments: {} tracked, {} active closing processes",
            assignments.len(),
            active
        );
        let mut records: Vec<&AssignmentRecord> = assignments.values().collect();
        records.sort_by(|a, b| a.fill_id.cmp(&b.fill_id));
        for record in records {
            let error = record
                .error
                .as_ref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "  {} {} {:?} amount={} status={:?}{}",
                record.fill_id,
                record.trading_pair,
                record.position_side,
                record.amount,
                record.status,
                error
            );
        }
        out
    }

    // Snapshot accessors

    #[must_use]
    pub async fn assignment(&self, fill_id: &str) -> Option<AssignmentRecord> {
        self.assignments.read().await.get(fill_id).cloned()
    }

    #[must_use]
    pub async fn assignment_count(&self) -> usize {
        self.assignments.read().await.len()
    }

    #[must_use]
    pub async fn list_assignments(&self) -> Vec<AssignmentRecord> {
        self.assignments.read().await.values().cloned().collect()
    }

    #[must_use]
    pub async fn process_record(&self, process_id: &str) -> Option<ClosingProcessRecord> {
        self.processes.read().await.get(process_id).cloned()
    }

    // Internals

    async fn mark_assignment(
        &self,
        fill_id: &str,
        status: AssignmentStatus,
        error_text: Option<String>,
    ) {
        let mut assignments = self.assignments.write().await;
        let Some(record) = assignments.get_mut(fill_id) else {
            debug!(%fill_id, "Status change for an unknown assignment");
            return;
        };
        if record.status.is_terminal() {
            if record.status != status {
                debug!(
                    %fill_id,
                    from = ?record.status,
                    to = ?status,
                    "Ignoring status change on a terminal assignment"
                );
            }
            return;
        }
        record.status = status;
        record.terminal_at = Some(Instant::now());
        if let Some(error_text) = error_text {
            record.error = Some(error_text);
        }
        info!(%fill_id, ?status, "Assignment finalized");
    }

    async fn find_live_process_exact(&self, fill_id: &str) -> Option<String> {
        self.live
            .read()
            .await
            .values()
            .find(|h| h.is_running() && h.fill_id.as_deref() == Some(fill_id))
            .map(|h| h.process_id.clone())
    }

    /// Deprecated compatibility path: upstream occasionally produces closing
    /// configs without the assignment tag. Matches by pair and price
    /// proximity, exact matches always win, and one process is never
    /// attributed to more than one assignment.
    async fn find_live_process_by_proximity(&self, fill_id: &str) -> Option<String> {
        let (trading_pair, reference_price, claimed) = {
            let assignments = self.assignments.read().await;
            let record = assignments.get(fill_id)?;
            let claimed: HashSet<String> = assignments
                .values()
                .filter(|r| r.fill_id != fill_id)
                .filter_map(|r| r.closing_process_id.clone())
                .collect();
            (record.trading_pair.clone(), record.reference_price, claimed)
        };
        let tolerance = reference_price * self.config.proximity_tolerance_pct / Decimal::from(100);

        self.live
            .read()
            .await
            .values()
            .filter(|h| {
                h.is_running()
                    && h.fill_id.is_none()
                    && h.trading_pair == trading_pair
                    && !claimed.contains(&h.process_id)
            })
            .map(|h| {
                let diff = (h.reference_price - reference_price).abs();
                (h.process_id.clone(), diff)
            })
            .filter(|(_, diff)| *diff <= tolerance)
            .min_by(|a, b| a.1.cmp(&b.1))
            .map(|(process_id, _)| process_id)
    }

    fn pair_accepted(&self, trading_pair: &str) -> bool {
        if self.config.watch_all_pairs {
            self.venue.recognizes_pair(trading_pair)
        } else {
            self.config.pair_in_watch_list(trading_pair)
        }
    }

    fn missing_process_grace(&self) -> Duration {
        Duration::from_secs(self.config.missing_process_grace_secs)
    }

    fn gc_min_interval(&self) -> Duration {
        Duration::from_secs(self.config.gc_min_interval_secs)
    }

    fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.config.terminal_retention_secs)
    }

    fn orphan_retention(&self) -> Duration {
        Duration::from_secs(self.config.orphan_retention_secs)
    }

    fn failure_inspection(&self) -> Duration {
        Duration::from_secs(self.config.failure_inspection_secs)
    }
}
