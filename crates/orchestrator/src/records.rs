use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use autoclose_core::events::{AssignmentFillEvent, PositionSide};
use autoclose_execution::process::ClosingConfig;

/// Lifecycle of one assignment record. There is no pending state: a record
/// only exists once the system has committed to acting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentStatus {
    Executing,
    Closed,
    Failed,
}

impl AssignmentStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// One exchange-reported assignment fill and the bookkeeping around closing
/// it.
#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub fill_id: String,
    pub trading_pair: String,
    pub position_side: PositionSide,
    pub amount: Decimal,
    pub reference_price: Decimal,
    pub received_at: Instant,
    pub received_at_utc: DateTime<Utc>,
    pub status: AssignmentStatus,
    /// Weak reference: identity of the closing process handling this
    /// assignment, not ownership. The process is owned by the supervisor.
    pub closing_process_id: Option<String>,
    pub process_linked_at: Option<Instant>,
    pub error: Option<String>,
    pub terminal_at: Option<Instant>,
}

impl AssignmentRecord {
    #[must_use]
    pub fn new(event: &AssignmentFillEvent) -> Self {
        Self {
            fill_id: event.fill_id.clone(),
            trading_pair: event.trading_pair.clone(),
            position_side: event.position_side,
            amount: event.amount,
            reference_price: event.price,
            received_at: Instant::now(),
            received_at_utc: Utc::now(),
            status: AssignmentStatus::Executing,
            closing_process_id: None,
            process_linked_at: None,
            error: None,
            terminal_at: None,
        }
    }

    pub fn link_process(&mut self, process_id: String) {
        self.closing_process_id = Some(process_id);
        self.process_linked_at = Some(Instant::now());
    }

    pub fn clear_process(&mut self) {
        self.closing_process_id = None;
        self.process_linked_at = None;
    }
}

/// Optimistic process reference used between enqueueing a creation request
/// and the supervisor reporting the real process id.
#[must_use]
pub fn placeholder_process_id(fill_id: &str) -> String {
    format!("pending-{fill_id}")
}

#[must_use]
pub fn is_placeholder(process_id: &str) -> bool {
    process_id.starts_with("pending-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessRecordStatus {
    Active,
    Completed,
    Failed,
}

impl ProcessRecordStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Registry-side bookkeeping for one closing process. The live state machine
/// itself is owned by the supervisor.
#[derive(Debug, Clone)]
pub struct ClosingProcessRecord {
    pub process_id: String,
    pub fill_id: String,
    pub created_at: Instant,
    pub created_at_utc: DateTime<Utc>,
    pub status: ProcessRecordStatus,
    pub config: ClosingConfig,
    pub terminal_at: Option<Instant>,
}

impl ClosingProcessRecord {
    #[must_use]
    pub fn new(process_id: &str, config: ClosingConfig) -> Self {
        Self {
            process_id: process_id.to_string(),
            fill_id: config.fill_id.clone(),
            created_at: Instant::now(),
            created_at_utc: Utc::now(),
            status: ProcessRecordStatus::Active,
            config,
            terminal_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_ids_are_recognizable() {
        let placeholder = placeholder_process_id("F1");
        assert!(is_placeholder(&placeholder));
        assert!(!is_placeholder("close-F1-1"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!AssignmentStatus::Executing.is_terminal());
        assert!(AssignmentStatus::Closed.is_terminal());
        assert!(AssignmentStatus::Failed.is_terminal());
        assert!(!ProcessRecordStatus::Active.is_terminal());
        assert!(ProcessRecordStatus::Completed.is_terminal());
    }
}
