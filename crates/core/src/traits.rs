use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::VenueError;
use crate::events::{CloseOrderType, OrderSide};
use crate::position::{OrderStatusReport, VenuePosition};

/// Query and order interface of the derivatives venue.
///
/// Implementations wrap the actual connector; everything here is treated as
/// eventually consistent — a just-assigned position may not be visible yet,
/// and order state may lag fills.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// All currently open positions for the account.
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, VenueError>;

    /// Place a reduce-only order and return the venue order id.
    ///
    /// `price` is only meaningful for limit orders.
    async fn place_reducing_order(
        &self,
        trading_pair: &str,
        side: OrderSide,
        amount: Decimal,
        order_type: CloseOrderType,
        price: Option<Decimal>,
    ) -> Result<String, VenueError>;

    /// Refresh the status of a previously placed order.
    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusReport, VenueError>;

    /// Cancel an open order. Cancelling an already-terminal order is not an
    /// error.
    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError>;

    /// Free balance available for placing an order on this pair, in the
    /// units the reducing order consumes (base for sells, quote for buys).
    async fn available_balance(&self, trading_pair: &str) -> Result<Decimal, VenueError>;

    /// Current mark price for the pair, used by price-based close barriers.
    async fn mark_price(&self, trading_pair: &str) -> Result<Decimal, VenueError>;

    /// Smallest order amount the venue accepts for this pair.
    fn min_order_size(&self, trading_pair: &str) -> Decimal;

    /// Whether the venue lists this trading pair at all.
    fn recognizes_pair(&self, trading_pair: &str) -> bool;
}
