use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of an open position on the venue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The order side that reduces a position on this side.
    #[must_use]
    pub const fn closing_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// How a position came to exist locally.
///
/// The closing engine consumes this tag directly instead of specializing
/// behavior by type: an assigned position is already open on the venue (no
/// entry order was ever placed locally) and may lag venue visibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionSource {
    OpenedByStrategy,
    ReceivedAsAssignment,
}

/// Order type used for the reducing order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CloseOrderType {
    #[default]
    Market,
    Limit,
}

/// An exchange-initiated assignment fill notification.
///
/// Delivered at-least-once by the venue connector; `fill_id` is the venue's
/// unique key for the assignment and is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentFillEvent {
    pub fill_id: String,
    pub trading_pair: String,
    pub position_side: PositionSide,
    pub amount: Decimal,
    pub price: Decimal,
    pub order_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}
