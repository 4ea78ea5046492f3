//! Closing process — drives one exchange-assigned position to zero exposure.
//!
//! The position is treated as already open: no opening order is ever placed.
//! Each process owns exactly one assignment, re-verifies venue state on every
//! control tick, and reports a single terminal outcome to its owner over the
//! event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use autoclose_core::config::AssignmentConfig;
use autoclose_core::error::VenueError;
use autoclose_core::events::{CloseOrderType, OrderSide, PositionSide, PositionSource};
use autoclose_core::position::VenuePosition;
use autoclose_core::traits::VenueClient;

use crate::barriers::{check_barriers, BarrierConfig, BarrierTrigger};
use crate::pending::{CloseReservation, PendingCloseLedger};

/// Lifecycle state of a closing process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    ShuttingDown,
    Terminated,
}

/// Terminal tag describing why the process ended. Set exactly once, before
/// the transition into [`ProcessState::Terminated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseType {
    Completed,
    Failed,
    TimeLimit,
    TrailingStop,
    StopLoss,
    TakeProfit,
    EarlyStop,
    InsufficientBalance,
}

/// Business outcome reported to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessOutcome {
    Success,
    Failure,
    /// The process ended without learning the position's fate (e.g. stopped
    /// early). Bookkeeping closes, the business outcome stays open.
    Unknown,
}

/// Terminal notification emitted by a closing process.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Completed {
        process_id: String,
        outcome: ProcessOutcome,
        reason: Option<String>,
    },
    Failed {
        process_id: String,
        error: String,
    },
}

/// Closing parameters captured at process creation.
///
/// `fill_id` is the single required assignment identifier, set once at
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingConfig {
    pub fill_id: String,
    pub connector_id: String,
    pub trading_pair: String,
    pub position_side: PositionSide,
    pub position_source: PositionSource,
    /// Assigned amount — the reference quantity for the close.
    pub amount: Decimal,
    pub reference_price: Decimal,
    pub close_percent: u8,
    pub order_type: CloseOrderType,
    pub slippage_buffer_pct: Decimal,
    pub close_immediately: bool,
    pub barriers: BarrierConfig,
    pub tick_interval: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub stall_window: Duration,
    pub max_order_age: Duration,
    pub position_grace: Duration,
    pub existence_check_every_n_ticks: u32,
}

impl ClosingConfig {
    /// Captures closing parameters from the pipeline config for one
    /// assignment.
    #[must_use]
    pub fn for_assignment(
        config: &AssignmentConfig,
        fill_id: &str,
        trading_pair: &str,
        position_side: PositionSide,
        amount: Decimal,
        reference_price: Decimal,
    ) -> Self {
        Self {
            fill_id: fill_id.to_string(),
            connector_id: config.connector_id.clone(),
            trading_pair: trading_pair.to_string(),
            position_side,
            position_source: PositionSource::ReceivedAsAssignment,
            amount,
            reference_price,
            close_percent: config.close_percent,
            order_type: config.close_order_type,
            slippage_buffer_pct: config.slippage_buffer_pct,
            close_immediately: config.close_immediately,
            barriers: BarrierConfig {
                time_limit: Some(Duration::from_secs(config.time_limit_secs)),
                stop_loss_pct: config.stop_loss_pct,
                take_profit_pct: config.take_profit_pct,
                trailing_stop_pct: config.trailing_stop_pct,
            },
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            retry_delay: Duration::from_millis(config.shutdown_retry_delay_ms),
            max_retries: config.max_retries,
            stall_window: Duration::from_secs(config.stall_window_secs),
            max_order_age: Duration::from_secs(config.max_order_age_secs),
            position_grace: Duration::from_secs(config.position_grace_secs),
            existence_check_every_n_ticks: config.existence_check_every_n_ticks,
        }
    }

    /// The amount this process is responsible for closing.
    #[must_use]
    pub fn target_amount(&self) -> Decimal {
        self.amount * Decimal::from(self.close_percent) / Decimal::from(100)
    }
}

/// The close order currently working on the venue.
struct TrackedOrder {
    order_id: String,
    executed: Decimal,
    placed_at: Instant,
}

pub struct ClosingProcess {
    process_id: String,
    config: ClosingConfig,
    venue: Arc<dyn VenueClient>,
    ledger: PendingCloseLedger,
    events: mpsc::Sender<ProcessEvent>,

    state: ProcessState,
    close_type: Option<CloseType>,
    /// Terminal tag reserved by the barrier that triggered the close.
    pending_close_type: Option<CloseType>,
    /// Accumulated close-fill volume across all orders placed so far.
    filled_amount: Decimal,
    order: Option<TrackedOrder>,
    reservation: Option<CloseReservation>,
    retries: u32,
    ticks: u64,
    failed_orders: u32,
    balance_short: bool,
    position_seen: bool,
    last_seen_amount: Option<Decimal>,
    last_error: Option<String>,
    trailing_extreme: Option<Decimal>,
    started_at: Instant,
    last_progress: Instant,
    running: Arc<AtomicBool>,
    should_stop: Arc<AtomicBool>,
}

impl ClosingProcess {
    #[must_use]
    pub fn new(
        process_id: String,
        config: ClosingConfig,
        venue: Arc<dyn VenueClient>,
        ledger: PendingCloseLedger,
        events: mpsc::Sender<ProcessEvent>,
    ) -> Self {
        let now = Instant::now();
        Self {
            process_id,
            config,
            venue,
            ledger,
            events,
            state: ProcessState::Running,
            close_type: None,
            pending_close_type: None,
            filled_amount: Decimal::ZERO,
            order: None,
            reservation: None,
            retries: 0,
            ticks: 0,
            failed_orders: 0,
            balance_short: false,
            position_seen: false,
            last_seen_amount: None,
            last_error: None,
            trailing_extreme: None,
            started_at: now,
            last_progress: now,
            running: Arc::new(AtomicBool::new(false)),
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Self-reported running flag, shared with the owner for liveness
    /// partitioning.
    #[must_use]
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Cooperative stop flag, checked between suspension points.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.should_stop.clone()
    }

    #[must_use]
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    /// Runs the process to termination and returns the terminal tag.
    pub async fn run(mut self) -> CloseType {
        self.running.store(true, Ordering::SeqCst);
        info!(
            process_id = %self.process_id,
            fill_id = %self.config.fill_id,
            trading_pair = %self.config.trading_pair,
            amount = %self.config.amount,
            "Closing process starting"
        );

        if !self.config.close_immediately {
            self.startup_checks().await;
        }

        loop {
            if self.state == ProcessState::Terminated {
                break;
            }
            if self.should_stop.load(Ordering::SeqCst) {
                self.finalize(CloseType::EarlyStop).await;
                break;
            }
            match self.state {
                ProcessState::Running => self.tick_running().await,
                ProcessState::ShuttingDown => self.tick_shutting_down().await,
                ProcessState::Terminated => {}
            }
            if self.state == ProcessState::Terminated {
                break;
            }
            let delay = if self.state == ProcessState::ShuttingDown {
                self.config.retry_delay
            } else {
                self.config.tick_interval
            };
            tokio::time::sleep(delay).await;
        }

        self.running.store(false, Ordering::SeqCst);
        self.close_type.unwrap_or(CloseType::Failed)
    }

    /// Visibility grace applies only to assigned positions; a position this
    /// system opened itself is already confirmed on the venue.
    fn visibility_grace(&self) -> Duration {
        match self.config.position_source {
            PositionSource::ReceivedAsAssignment => self.config.position_grace,
            PositionSource::OpenedByStrategy => Duration::ZERO,
        }
    }

    /// Confirms the position is visible and that the balance covers the
    /// reducing order. Insufficient balance never blocks the attempt:
    /// leaving an unmanaged position open is worse than a rejected order.
    async fn startup_checks(&mut self) {
        let deadline = self.started_at + self.visibility_grace();
        let poll = self.config.tick_interval.min(Duration::from_millis(500));
        loop {
            match self.venue.get_positions().await {
                Ok(positions) => {
                    if let Some(amount) = self.find_position(&positions) {
                        self.position_seen = true;
                        self.last_seen_amount = Some(amount);
                        break;
                    }
                    if Instant::now() >= deadline {
                        debug!(
                            fill_id = %self.config.fill_id,
                            "Assigned position not visible within the grace window"
                        );
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Position query failed during startup");
                    if Instant::now() >= deadline {
                        break;
                    }
                }
            }
            tokio::time::sleep(poll).await;
        }

        let required = match self.config.position_side.closing_side() {
            OrderSide::Sell => self.config.target_amount(),
            OrderSide::Buy => self.config.target_amount() * self.config.reference_price,
        };
        match self.venue.available_balance(&self.config.trading_pair).await {
            Ok(balance) if balance < required => {
                self.balance_short = true;
                warn!(
                    %balance,
                    %required,
                    trading_pair = %self.config.trading_pair,
                    "Insufficient balance for the close order, attempting anyway"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Balance check failed during startup"),
        }
    }

    async fn tick_running(&mut self) {
        self.ticks += 1;
        if self.ticks > 1 {
            // Periodic-work counter, gates the lower-frequency checks below.
            self.retries += 1;
        }

        let check_existence = self.ticks == 1
            || self.config.existence_check_every_n_ticks <= 1
            || self.retries % self.config.existence_check_every_n_ticks == 0;
        if check_existence {
            match self.venue.get_positions().await {
                Ok(positions) => match self.find_position(&positions) {
                    Some(amount) => {
                        self.position_seen = true;
                        self.last_seen_amount = Some(amount);
                    }
                    None => {
                        if self.position_seen
                            || self.started_at.elapsed() >= self.visibility_grace()
                        {
                            info!(
                                fill_id = %self.config.fill_id,
                                "Position no longer open on the venue, nothing left to close"
                            );
                            self.finalize(CloseType::Completed).await;
                        }
                        // Otherwise the assignment may simply not be visible
                        // yet; wait out the grace window.
                        return;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Position query failed");
                    return;
                }
            }
        }

        // Primary duplicate-order guard.
        if self.filled_amount >= self.config.target_amount() {
            self.finalize(self.pending_close_type.unwrap_or(CloseType::Completed))
                .await;
            return;
        }

        let mark = if self.config.barriers.needs_mark_price() {
            match self.venue.mark_price(&self.config.trading_pair).await {
                Ok(price) => Some(price),
                Err(e) => {
                    warn!(error = %e, "Mark price unavailable, skipping price barriers");
                    None
                }
            }
        } else {
            None
        };

        if let Some(trigger) = check_barriers(
            &self.config.barriers,
            self.config.position_side,
            self.config.reference_price,
            mark,
            self.started_at.elapsed(),
            &mut self.trailing_extreme,
        ) {
            self.cancel_stray_order().await;
            self.pending_close_type = Some(close_type_for(trigger));
            self.state = ProcessState::ShuttingDown;
            self.touch_progress();
            self.ensure_close_order().await;
        }
    }

    async fn tick_shutting_down(&mut self) {
        // Guard the race where the position vanished between order placement
        // and now.
        match self.venue.get_positions().await {
            Ok(positions) => match self.find_position(&positions) {
                None => {
                    info!(
                        fill_id = %self.config.fill_id,
                        "Position gone from the venue, close complete"
                    );
                    self.finalize(CloseType::Completed).await;
                    return;
                }
                Some(amount) => self.last_seen_amount = Some(amount),
            },
            Err(e) => warn!(error = %e, "Position query failed during shutdown"),
        }

        if let Some(order_id) = self.order.as_ref().map(|o| o.order_id.clone()) {
            match self.venue.get_order_status(&order_id).await {
                Ok(report) => {
                    let previous = self.order.as_ref().map_or(Decimal::ZERO, |o| o.executed);
                    let delta = report.executed_amount - previous;
                    if delta > Decimal::ZERO {
                        self.filled_amount += delta;
                        if let Some(order) = self.order.as_mut() {
                            order.executed = report.executed_amount;
                        }
                        self.touch_progress();
                        debug!(
                            %order_id,
                            executed = %report.executed_amount,
                            total_filled = %self.filled_amount,
                            "Close order progress"
                        );
                    }
                    if report.is_filled || self.filled_amount >= self.config.target_amount() {
                        self.finalize(self.pending_close_type.unwrap_or(CloseType::Completed))
                            .await;
                        return;
                    }
                    if report.is_done {
                        warn!(%order_id, "Close order ended without a full fill, replacing");
                        self.abandon_order();
                    } else if self
                        .order
                        .as_ref()
                        .is_some_and(|o| o.placed_at.elapsed() >= self.config.max_order_age)
                    {
                        info!(%order_id, "Close order exceeded max age, resubmitting");
                        if let Err(e) = self.venue.cancel_order(&order_id).await {
                            debug!(error = %e, %order_id, "Cancel of aged close order failed");
                        }
                        self.abandon_order();
                    }
                }
                Err(VenueError::UnknownOrder(_)) => {
                    // Lost order: record the failure locally and place a
                    // fresh one on the next pass.
                    warn!(%order_id, "Close order disappeared from the venue");
                    self.failed_orders += 1;
                    self.abandon_order();
                }
                Err(e) => warn!(error = %e, %order_id, "Order status refresh failed"),
            }
        }

        if self.order.is_none() {
            self.ensure_close_order().await;
            if self.state == ProcessState::Terminated {
                return;
            }
        }

        if self.retries > self.config.max_retries
            || self.last_progress.elapsed() >= self.config.stall_window
        {
            self.force_exit().await;
            return;
        }
        self.retries += 1;
    }

    /// Places the reducing order for whatever is still outstanding, if no
    /// order is currently working.
    async fn ensure_close_order(&mut self) {
        if self.order.is_some() {
            return;
        }

        let live = match self.last_seen_amount {
            Some(amount) => amount,
            None => match self.venue.get_positions().await {
                Ok(positions) => match self.find_position(&positions) {
                    Some(amount) => amount,
                    None => {
                        self.finalize(CloseType::Completed).await;
                        return;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Position query failed before order placement");
                    return;
                }
            },
        };

        let remaining = self.config.target_amount() - self.filled_amount;
        if remaining <= Decimal::ZERO {
            self.finalize(self.pending_close_type.unwrap_or(CloseType::Completed))
                .await;
            return;
        }

        let requested = remaining.min(live);
        let Some(reservation) = self.ledger.reserve(
            &self.config.connector_id,
            &self.config.trading_pair,
            requested,
            live,
        ) else {
            debug!(
                trading_pair = %self.config.trading_pair,
                "No close headroom left on the live position"
            );
            return;
        };

        let amount = reservation.amount();
        let min_size = self.venue.min_order_size(&self.config.trading_pair);
        if amount < min_size {
            drop(reservation);
            info!(
                %amount,
                %min_size,
                "Outstanding amount below the venue minimum, treating as closed"
            );
            self.finalize(self.pending_close_type.unwrap_or(CloseType::Completed))
                .await;
            return;
        }

        let side = self.config.position_side.closing_side();
        match self
            .venue
            .place_reducing_order(
                &self.config.trading_pair,
                side,
                amount,
                self.config.order_type,
                self.limit_price(),
            )
            .await
        {
            Ok(order_id) => {
                info!(
                    %order_id,
                    %amount,
                    ?side,
                    trading_pair = %self.config.trading_pair,
                    "Placed reducing order"
                );
                self.order = Some(TrackedOrder {
                    order_id,
                    executed: Decimal::ZERO,
                    placed_at: Instant::now(),
                });
                self.reservation = Some(reservation);
                self.touch_progress();
            }
            Err(e) if e.is_position_already_closed() => {
                drop(reservation);
                info!(error = %e, "Venue reports the position is already closed");
                self.finalize(CloseType::Completed).await;
            }
            Err(e) => {
                drop(reservation);
                self.last_error = Some(e.to_string());
                warn!(error = %e, retries = self.retries, "Close order placement failed");
            }
        }
    }

    /// Retry ceiling or stall window hit: one last venue check decides the
    /// outcome.
    async fn force_exit(&mut self) {
        warn!(
            retries = self.retries,
            failed_orders = self.failed_orders,
            stalled_secs = self.last_progress.elapsed().as_secs(),
            "Retry ceiling or stall window reached, forcing a final check"
        );
        match self.venue.get_positions().await {
            Ok(positions) if self.find_position(&positions).is_none() => {
                self.finalize(CloseType::Completed).await;
            }
            Ok(_) => {
                let close_type = if self.balance_short {
                    CloseType::InsufficientBalance
                } else {
                    CloseType::Failed
                };
                self.finalize(close_type).await;
            }
            Err(e) => {
                warn!(error = %e, "Final position check failed");
                self.finalize(CloseType::Failed).await;
            }
        }
    }

    /// Sets the terminal tag exactly once and notifies the owner.
    async fn finalize(&mut self, close_type: CloseType) {
        if self.state == ProcessState::Terminated {
            return;
        }
        self.cancel_stray_order().await;
        self.reservation = None; // releases the pending-close claim
        self.close_type = Some(close_type);
        self.state = ProcessState::Terminated;
        self.running.store(false, Ordering::SeqCst);

        let event = match close_type {
            CloseType::Completed
            | CloseType::TimeLimit
            | CloseType::StopLoss
            | CloseType::TakeProfit
            | CloseType::TrailingStop => ProcessEvent::Completed {
                process_id: self.process_id.clone(),
                outcome: ProcessOutcome::Success,
                reason: None,
            },
            CloseType::EarlyStop => ProcessEvent::Completed {
                process_id: self.process_id.clone(),
                outcome: ProcessOutcome::Unknown,
                reason: Some("stopped before the position outcome was known".to_string()),
            },
            CloseType::Failed | CloseType::InsufficientBalance => ProcessEvent::Failed {
                process_id: self.process_id.clone(),
                error: self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("{close_type:?}")),
            },
        };
        if self.events.send(event).await.is_err() {
            debug!("Process event receiver dropped");
        }
        info!(
            process_id = %self.process_id,
            ?close_type,
            filled = %self.filled_amount,
            retries = self.retries,
            "Closing process finished"
        );
    }

    async fn cancel_stray_order(&mut self) {
        if let Some(order) = self.order.take() {
            if let Err(e) = self.venue.cancel_order(&order.order_id).await {
                debug!(error = %e, order_id = %order.order_id, "Stray order cancel failed");
            }
            self.reservation = None;
        }
    }

    fn abandon_order(&mut self) {
        self.order = None;
        self.reservation = None;
    }

    fn touch_progress(&mut self) {
        self.last_progress = Instant::now();
    }

    fn find_position(&self, positions: &[VenuePosition]) -> Option<Decimal> {
        positions
            .iter()
            .find(|p| p.matches(&self.config.trading_pair, self.config.position_side))
            .map(|p| p.amount)
    }

    fn limit_price(&self) -> Option<Decimal> {
        if self.config.order_type != CloseOrderType::Limit {
            return None;
        }
        let buffer =
            self.config.reference_price * self.config.slippage_buffer_pct / Decimal::from(100);
        Some(match self.config.position_side.closing_side() {
            OrderSide::Sell => self.config.reference_price - buffer,
            OrderSide::Buy => self.config.reference_price + buffer,
        })
    }
}

const fn close_type_for(trigger: BarrierTrigger) -> CloseType {
    match trigger {
        BarrierTrigger::TimeLimit => CloseType::TimeLimit,
        BarrierTrigger::StopLoss => CloseType::StopLoss,
        BarrierTrigger::TakeProfit => CloseType::TakeProfit,
        BarrierTrigger::TrailingStop => CloseType::TrailingStop,
    }
}
