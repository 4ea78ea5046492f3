use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::events::PositionSide;

/// A position snapshot as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub trading_pair: String,
    pub side: PositionSide,
    pub amount: Decimal,
    pub entry_price: Decimal,
}

impl VenuePosition {
    /// Whether this snapshot is the venue-side counterpart of the given
    /// pair/side combination.
    #[must_use]
    pub fn matches(&self, trading_pair: &str, side: PositionSide) -> bool {
        self.trading_pair == trading_pair && self.side == side
    }
}

/// Status of a single order as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub order_id: String,
    /// The order reached a terminal state on the venue (filled, canceled, or
    /// rejected).
    pub is_done: bool,
    /// The order filled completely.
    pub is_filled: bool,
    /// Cumulative executed amount, in base units.
    pub executed_amount: Decimal,
}
