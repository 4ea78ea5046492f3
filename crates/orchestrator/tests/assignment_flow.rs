//! End-to-end flows: notification → registry → closing process → terminal
//! status, against a scriptable mock venue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use autoclose_core::config::AssignmentConfig;
use autoclose_core::error::VenueError;
use autoclose_core::events::{
    AssignmentFillEvent, CloseOrderType, OrderSide, PositionSide,
};
use autoclose_core::position::{OrderStatusReport, VenuePosition};
use autoclose_core::traits::VenueClient;
use autoclose_orchestrator::records::AssignmentStatus;
use autoclose_orchestrator::registry::AssignmentRegistry;
use autoclose_orchestrator::service::AssignmentService;

#[derive(Clone)]
struct Placement {
    order_id: String,
    trading_pair: String,
    side: OrderSide,
    amount: Decimal,
}

struct MockOrder {
    trading_pair: String,
    side: PositionSide,
    amount: Decimal,
    executed: Decimal,
    is_done: bool,
    is_filled: bool,
    lost: bool,
}

#[derive(Default)]
struct MockState {
    positions: Vec<VenuePosition>,
    orders: HashMap<String, MockOrder>,
    placements: Vec<Placement>,
    next_order_id: u64,
    reject_with: Option<String>,
    fill_instantly: bool,
}

/// Scriptable venue: positions and order fills are driven by the test.
struct MockVenue {
    state: Mutex<MockState>,
}

impl MockVenue {
    fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_position(&self, trading_pair: &str, side: PositionSide, amount: Decimal, entry: Decimal) {
        self.lock().positions.push(VenuePosition {
            trading_pair: trading_pair.to_string(),
            side,
            amount,
            entry_price: entry,
        });
    }

    fn fill_instantly(&self, enabled: bool) {
        self.lock().fill_instantly = enabled;
    }

    fn reject_placements(&self, message: &str) {
        self.lock().reject_with = Some(message.to_string());
    }

    fn placements(&self) -> Vec<Placement> {
        self.lock().placements.clone()
    }

    /// Executes part of the order: bumps its cumulative fill and reduces the
    /// venue position accordingly.
    fn partial_fill(&self, placement_index: usize, amount: Decimal) {
        let mut state = self.lock();
        let order_id = state.placements[placement_index].order_id.clone();
        let (pair, side) = {
            let order = state.orders.get_mut(&order_id).expect("order exists");
            order.executed += amount;
            (order.trading_pair.clone(), order.side)
        };
        reduce_position(&mut state, &pair, side, amount);
    }

    /// Fills the order completely and reduces the venue position by the
    /// remainder.
    fn complete_order(&self, placement_index: usize) {
        let mut state = self.lock();
        let order_id = state.placements[placement_index].order_id.clone();
        let (pair, side, remainder) = {
            let order = state.orders.get_mut(&order_id).expect("order exists");
            let remainder = order.amount - order.executed;
            order.executed = order.amount;
            order.is_done = true;
            order.is_filled = true;
            (order.trading_pair.clone(), order.side, remainder)
        };
        reduce_position(&mut state, &pair, side, remainder);
    }

    /// The venue forgets the order without ever reporting a terminal state.
    fn lose_order(&self, placement_index: usize) {
        let mut state = self.lock();
        let order_id = state.placements[placement_index].order_id.clone();
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.lost = true;
        }
    }
}

fn reduce_position(state: &mut MockState, trading_pair: &str, side: PositionSide, delta: Decimal) {
    for position in &mut state.positions {
        if position.matches(trading_pair, side) {
            position.amount -= delta;
        }
    }
    state.positions.retain(|p| p.amount > Decimal::ZERO);
}

#[async_trait]
impl VenueClient for MockVenue {
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        Ok(self.lock().positions.clone())
    }

    async fn place_reducing_order(
        &self,
        trading_pair: &str,
        side: OrderSide,
        amount: Decimal,
        _order_type: CloseOrderType,
        _price: Option<Decimal>,
    ) -> Result<String, VenueError> {
        let mut state = self.lock();
        if let Some(message) = state.reject_with.clone() {
            return Err(VenueError::Rejected(message));
        }
        state.next_order_id += 1;
        let order_id = format!("mock-{}", state.next_order_id);
        let position_side = match side {
            OrderSide::Sell => PositionSide::Long,
            OrderSide::Buy => PositionSide::Short,
        };
        state.orders.insert(
            order_id.clone(),
            MockOrder {
                trading_pair: trading_pair.to_string(),
                side: position_side,
                amount,
                executed: Decimal::ZERO,
                is_done: false,
                is_filled: false,
                lost: false,
            },
        );
        state.placements.push(Placement {
            order_id: order_id.clone(),
            trading_pair: trading_pair.to_string(),
            side,
            amount,
        });
        if state.fill_instantly {
            let order = state.orders.get_mut(&order_id).expect("just inserted");
            order.executed = amount;
            order.is_done = true;
            order.is_filled = true;
            let pair = order.trading_pair.clone();
            reduce_position(&mut state, &pair, position_side, amount);
        }
        Ok(order_id)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusReport, VenueError> {
        let state = self.lock();
        let Some(order) = state.orders.get(order_id) else {
            return Err(VenueError::UnknownOrder(order_id.to_string()));
        };
        if order.lost {
            return Err(VenueError::UnknownOrder(order_id.to_string()));
        }
        Ok(OrderStatusReport {
            order_id: order_id.to_string(),
            is_done: order.is_done,
            is_filled: order.is_filled,
            executed_amount: order.executed,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError> {
        let mut state = self.lock();
        if let Some(order) = state.orders.get_mut(order_id) {
            if !order.is_filled {
                order.is_done = true;
            }
        }
        Ok(())
    }

    async fn available_balance(&self, _trading_pair: &str) -> Result<Decimal, VenueError> {
        Ok(dec!(1000000))
    }

    async fn mark_price(&self, _trading_pair: &str) -> Result<Decimal, VenueError> {
        Ok(dec!(50000))
    }

    fn min_order_size(&self, _trading_pair: &str) -> Decimal {
        dec!(0.0001)
    }

    fn recognizes_pair(&self, _trading_pair: &str) -> bool {
        true
    }
}

fn test_config() -> AssignmentConfig {
    AssignmentConfig {
        connector_id: "kraken_perpetual".to_string(),
        watch_pairs: vec!["BTC-USD".to_string()],
        tick_interval_ms: 20,
        shutdown_retry_delay_ms: 20,
        max_retries: 50,
        stall_window_secs: 30,
        position_grace_secs: 0,
        reconcile_interval_secs: 1,
        ..AssignmentConfig::default()
    }
}

fn fill_event(fill_id: &str, amount: Decimal) -> AssignmentFillEvent {
    AssignmentFillEvent {
        fill_id: fill_id.to_string(),
        trading_pair: "BTC-USD".to_string(),
        position_side: PositionSide::Long,
        amount,
        price: dec!(50000),
        order_id: Some("venue-order-1".to_string()),
        timestamp: Utc::now(),
    }
}

async fn wait_for_status(registry: &AssignmentRegistry, fill_id: &str, status: AssignmentStatus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if registry
            .assignment(fill_id)
            .await
            .is_some_and(|r| r.status == status)
        {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {fill_id} to reach {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_placements(venue: &MockVenue, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if venue.placements().len() >= count {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {count} placements"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn assignment_fill_drives_the_position_closed() {
    let venue = Arc::new(MockVenue::new());
    venue.add_position("BTC-USD", PositionSide::Long, dec!(0.1), dec!(50000));
    venue.fill_instantly(true);
    let service = AssignmentService::start(test_config(), venue.clone()).unwrap();
    let registry = service.registry();

    service.on_assignment_notification(fill_event("F1", dec!(0.1)));

    // Record lands as EXECUTING with the long side preserved, then closes.
    wait_for_status(&registry, "F1", AssignmentStatus::Closed).await;
    let record = registry.assignment("F1").await.unwrap();
    assert_eq!(record.position_side, PositionSide::Long);
    assert_eq!(record.amount, dec!(0.1));

    // The close was a single SELL for the assigned amount.
    let placements = venue.placements();
    assert_eq!(placements.len(), 1);
    assert_eq!(placements[0].side, OrderSide::Sell);
    assert_eq!(placements[0].amount, dec!(0.1));
    assert_eq!(placements[0].trading_pair, "BTC-USD");

    service.shutdown().await;
}

#[tokio::test]
async fn duplicate_notifications_admit_exactly_once() {
    let venue = Arc::new(MockVenue::new());
    venue.add_position("BTC-USD", PositionSide::Long, dec!(0.1), dec!(50000));
    venue.fill_instantly(true);
    let service = AssignmentService::start(test_config(), venue.clone()).unwrap();
    let registry = service.registry();

    for _ in 0..5 {
        service.on_assignment_notification(fill_event("F1", dec!(0.1)));
    }

    wait_for_status(&registry, "F1", AssignmentStatus::Closed).await;
    assert_eq!(registry.assignment_count().await, 1);
    assert_eq!(venue.placements().len(), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn externally_closed_position_needs_no_orders() {
    // The position was already closed through the exchange UI before the
    // process ever ran.
    let venue = Arc::new(MockVenue::new());
    let service = AssignmentService::start(test_config(), venue.clone()).unwrap();
    let registry = service.registry();

    service.on_assignment_notification(fill_event("F1", dec!(0.1)));

    wait_for_status(&registry, "F1", AssignmentStatus::Closed).await;
    assert!(venue.placements().is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn lost_partial_order_is_replaced_for_the_remainder() {
    let venue = Arc::new(MockVenue::new());
    venue.add_position("BTC-USD", PositionSide::Long, dec!(0.1), dec!(50000));
    let service = AssignmentService::start(test_config(), venue.clone()).unwrap();
    let registry = service.registry();

    service.on_assignment_notification(fill_event("F1", dec!(0.1)));
    wait_for_placements(&venue, 1).await;

    // 0.05 of 0.1 executes, then the venue forgets the order entirely.
    venue.partial_fill(0, dec!(0.05));
    tokio::time::sleep(Duration::from_millis(100)).await;
    venue.lose_order(0);

    // A fresh order goes out for exactly the remaining 0.05.
    wait_for_placements(&venue, 2).await;
    let placements = venue.placements();
    assert_eq!(placements[1].amount, dec!(0.05));

    venue.complete_order(1);
    wait_for_status(&registry, "F1", AssignmentStatus::Closed).await;

    service.shutdown().await;
}

#[tokio::test]
async fn concurrent_assignments_never_overclose_the_position() {
    // One 0.3 BTC venue position backing two assignments of 0.1 and 0.2.
    let venue = Arc::new(MockVenue::new());
    venue.add_position("BTC-USD", PositionSide::Long, dec!(0.3), dec!(50000));
    let service = AssignmentService::start(test_config(), venue.clone()).unwrap();
    let registry = service.registry();

    service.on_assignment_notification(fill_event("F1", dec!(0.1)));
    wait_for_placements(&venue, 1).await;
    service.on_assignment_notification(fill_event("F2", dec!(0.2)));
    wait_for_placements(&venue, 2).await;

    let placements = venue.placements();
    assert_eq!(placements[0].amount, dec!(0.1));
    assert_eq!(placements[1].amount, dec!(0.2));
    let total: Decimal = placements.iter().map(|p| p.amount).sum();
    assert!(total <= dec!(0.3));

    venue.complete_order(0);
    venue.complete_order(1);
    wait_for_status(&registry, "F1", AssignmentStatus::Closed).await;
    wait_for_status(&registry, "F2", AssignmentStatus::Closed).await;

    service.shutdown().await;
}

#[tokio::test]
async fn retry_ceiling_with_a_live_position_fails_the_assignment() {
    let venue = Arc::new(MockVenue::new());
    venue.add_position("BTC-USD", PositionSide::Long, dec!(0.1), dec!(50000));
    venue.reject_placements("exchange unavailable");
    let mut config = test_config();
    config.max_retries = 3;
    let service = AssignmentService::start(config, venue.clone()).unwrap();
    let registry = service.registry();

    service.on_assignment_notification(fill_event("F1", dec!(0.1)));

    wait_for_status(&registry, "F1", AssignmentStatus::Failed).await;
    let record = registry.assignment("F1").await.unwrap();
    assert!(record
        .error
        .as_deref()
        .is_some_and(|e| e.contains("exchange unavailable")));

    // Failures stay visible in the operator report.
    let report = service.status_report().await;
    assert!(report.contains("F1"));
    assert!(report.contains("Failed"));

    service.shutdown().await;
}

#[tokio::test]
async fn already_closed_rejection_counts_as_success() {
    let venue = Arc::new(MockVenue::new());
    venue.add_position("BTC-USD", PositionSide::Long, dec!(0.1), dec!(50000));
    venue.reject_placements("Order would not reduce position");
    let service = AssignmentService::start(test_config(), venue.clone()).unwrap();
    let registry = service.registry();

    service.on_assignment_notification(fill_event("F1", dec!(0.1)));

    wait_for_status(&registry, "F1", AssignmentStatus::Closed).await;
    assert!(venue.placements().is_empty());

    service.shutdown().await;
}
