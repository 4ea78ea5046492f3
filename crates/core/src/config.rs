use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::events::CloseOrderType;

/// Configuration for the assignment auto-close pipeline.
///
/// Per-process closing parameters are captured from this at creation time,
/// so editing the config never changes the behavior of processes already in
/// flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentConfig {
    /// Connector/venue identifier (e.g. `kraken_perpetual`).
    pub connector_id: String,

    /// Explicit trading-pair watch-list. Ignored when `watch_all_pairs` is
    /// set.
    #[serde(default)]
    pub watch_pairs: Vec<String>,

    /// Accept assignments on any pair the venue recognizes.
    #[serde(default)]
    pub watch_all_pairs: bool,

    // Closing order parameters
    #[serde(default)]
    pub close_order_type: CloseOrderType,
    /// Percentage of the assigned amount to close (1-100).
    #[serde(default = "default_close_percent")]
    pub close_percent: u8,
    /// Price buffer applied to limit closes, as a percentage.
    #[serde(default = "default_slippage_buffer_pct")]
    pub slippage_buffer_pct: Decimal,
    /// Cancel and resubmit a live close order older than this.
    #[serde(default = "default_max_order_age_secs")]
    pub max_order_age_secs: u64,
    /// Skip startup validation and attempt closure on the first tick.
    #[serde(default = "default_close_immediately")]
    pub close_immediately: bool,

    // Barriers; assignments normally arm only the time limit, at zero.
    #[serde(default)]
    pub time_limit_secs: u64,
    #[serde(default)]
    pub stop_loss_pct: Option<Decimal>,
    #[serde(default)]
    pub take_profit_pct: Option<Decimal>,
    #[serde(default)]
    pub trailing_stop_pct: Option<Decimal>,

    // Process cadence and ceilings
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_shutdown_retry_delay_ms")]
    pub shutdown_retry_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stall_window_secs")]
    pub stall_window_secs: u64,
    /// Grace window for a just-assigned position that is not yet visible.
    #[serde(default = "default_position_grace_secs")]
    pub position_grace_secs: u64,
    /// Re-verify position existence only every Nth tick.
    #[serde(default = "default_existence_check_every_n_ticks")]
    pub existence_check_every_n_ticks: u32,

    // Reconciliation and retention
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// How long an unresolvable process reference is tolerated before it is
    /// cleared.
    #[serde(default = "default_missing_process_grace_secs")]
    pub missing_process_grace_secs: u64,
    #[serde(default = "default_gc_min_interval_secs")]
    pub gc_min_interval_secs: u64,
    /// Retention for terminal assignment and process records.
    #[serde(default = "default_terminal_retention_secs")]
    pub terminal_retention_secs: u64,
    /// Accelerated retention for orphaned process records.
    #[serde(default = "default_orphan_retention_secs")]
    pub orphan_retention_secs: u64,
    /// How long failed assignments stay visible for operator inspection.
    #[serde(default = "default_failure_inspection_secs")]
    pub failure_inspection_secs: u64,

    // Deprecated compatibility behavior: match untagged closing processes to
    // assignments by pair and price proximity. Remove once every connector
    // tags its closing configs with the fill id.
    #[serde(default)]
    pub legacy_proximity_match: bool,
    #[serde(default = "default_proximity_tolerance_pct")]
    pub proximity_tolerance_pct: Decimal,
}

const fn default_close_percent() -> u8 {
    100
}

fn default_slippage_buffer_pct() -> Decimal {
    Decimal::new(1, 1) // 0.1%
}

const fn default_max_order_age_secs() -> u64 {
    120
}

const fn default_close_immediately() -> bool {
    true
}

const fn default_tick_interval_ms() -> u64 {
    5000
}

const fn default_shutdown_retry_delay_ms() -> u64 {
    5000
}

const fn default_max_retries() -> u32 {
    10
}

const fn default_stall_window_secs() -> u64 {
    60
}

const fn default_position_grace_secs() -> u64 {
    10
}

const fn default_existence_check_every_n_ticks() -> u32 {
    3
}

const fn default_reconcile_interval_secs() -> u64 {
    10
}

const fn default_missing_process_grace_secs() -> u64 {
    30
}

const fn default_gc_min_interval_secs() -> u64 {
    60
}

const fn default_terminal_retention_secs() -> u64 {
    3600
}

const fn default_orphan_retention_secs() -> u64 {
    300
}

const fn default_failure_inspection_secs() -> u64 {
    600
}

fn default_proximity_tolerance_pct() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            connector_id: String::new(),
            watch_pairs: Vec::new(),
            watch_all_pairs: false,
            close_order_type: CloseOrderType::default(),
            close_percent: default_close_percent(),
            slippage_buffer_pct: default_slippage_buffer_pct(),
            max_order_age_secs: default_max_order_age_secs(),
            close_immediately: default_close_immediately(),
            time_limit_secs: 0,
            stop_loss_pct: None,
            take_profit_pct: None,
            trailing_stop_pct: None,
            tick_interval_ms: default_tick_interval_ms(),
            shutdown_retry_delay_ms: default_shutdown_retry_delay_ms(),
            max_retries: default_max_retries(),
            stall_window_secs: default_stall_window_secs(),
            position_grace_secs: default_position_grace_secs(),
            existence_check_every_n_ticks: default_existence_check_every_n_ticks(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            missing_process_grace_secs: default_missing_process_grace_secs(),
            gc_min_interval_secs: default_gc_min_interval_secs(),
            terminal_retention_secs: default_terminal_retention_secs(),
            orphan_retention_secs: default_orphan_retention_secs(),
            failure_inspection_secs: default_failure_inspection_secs(),
            legacy_proximity_match: false,
            proximity_tolerance_pct: default_proximity_tolerance_pct(),
        }
    }
}

impl AssignmentConfig {
    /// Validates option ranges that serde defaults cannot express.
    ///
    /// # Errors
    /// Returns an error if `close_percent` is outside 1-100 or the connector
    /// id is empty.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connector_id.is_empty() {
            anyhow::bail!("connector_id must be set");
        }
        if self.close_percent == 0 || self.close_percent > 100 {
            anyhow::bail!(
                "close_percent must be within 1-100, got {}",
                self.close_percent
            );
        }
        if !self.watch_all_pairs && self.watch_pairs.is_empty() {
            anyhow::bail!("either watch_pairs or watch_all_pairs must be configured");
        }
        Ok(())
    }

    /// Whether events on this pair should be admitted. The venue check for
    /// `watch_all_pairs` happens at the admission site, where a client is
    /// available.
    #[must_use]
    pub fn pair_in_watch_list(&self, trading_pair: &str) -> bool {
        self.watch_all_pairs || self.watch_pairs.iter().any(|p| p == trading_pair)
    }
}
