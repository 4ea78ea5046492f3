//! Event ingestion — the synchronous entry point for assignment fill
//! notifications.
//!
//! The connector delivers notifications at-least-once and possibly
//! concurrently. The entry point never blocks and never returns an error to
//! the caller; all real work happens on a spawned task under the registry's
//! admission lock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use autoclose_core::events::AssignmentFillEvent;

use crate::registry::AssignmentRegistry;

type InFlightSet = Arc<Mutex<HashSet<String>>>;

pub struct AssignmentIngestor {
    registry: Arc<AssignmentRegistry>,
    /// Fill ids scheduled but not yet committed to the registry, to absorb
    /// duplicate delivery ahead of the admission lock.
    in_flight: InFlightSet,
}

impl AssignmentIngestor {
    #[must_use]
    pub fn new(registry: Arc<AssignmentRegistry>) -> Self {
        Self {
            registry,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Handles one assignment fill notification. Returns immediately; must be
    /// called from within a tokio runtime.
    pub fn on_assignment_notification(&self, event: AssignmentFillEvent) {
        if event.fill_id.is_empty() {
            warn!(
                trading_pair = %event.trading_pair,
                "Assignment event without a fill id discarded"
            );
            return;
        }

        {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !in_flight.insert(event.fill_id.clone()) {
                debug!(fill_id = %event.fill_id, "Assignment event already being processed");
                return;
            }
        }

        let registry = self.registry.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            // Released on every exit path so a failure here never blocks
            // future events for the same fill id.
            let _guard = InFlightGuard {
                set: in_flight,
                fill_id: event.fill_id.clone(),
            };
            registry.admit_assignment(event).await;
        });
    }
}

struct InFlightGuard {
    set: InFlightSet,
    fill_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.fill_id);
    }
}
