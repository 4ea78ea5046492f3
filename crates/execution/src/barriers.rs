//! Close barriers — time limit, stop loss, take profit, trailing stop.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use autoclose_core::events::PositionSide;

/// Which barrier fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierTrigger {
    TimeLimit,
    StopLoss,
    TakeProfit,
    TrailingStop,
}

/// Barrier arming configuration for one closing process.
///
/// Assignments normally arm only the time limit, and commonly at zero so the
/// close fires on the first control tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BarrierConfig {
    pub time_limit: Option<Duration>,
    /// Close when the position has lost this percentage.
    pub stop_loss_pct: Option<Decimal>,
    /// Close when the position has gained this percentage.
    pub take_profit_pct: Option<Decimal>,
    /// Close on this percentage retracement from the best seen price.
    pub trailing_stop_pct: Option<Decimal>,
}

impl BarrierConfig {
    /// Whether any armed barrier needs a mark price to evaluate.
    #[must_use]
    pub const fn needs_mark_price(&self) -> bool {
        self.stop_loss_pct.is_some()
            || self.take_profit_pct.is_some()
            || self.trailing_stop_pct.is_some()
    }
}

/// Check all armed barriers. Returns the first trigger, if any.
///
/// `trailing_extreme` carries the best seen price across ticks (highest for
/// longs, lowest for shorts) and is updated in place.
#[must_use]
pub fn check_barriers(
    config: &BarrierConfig,
    side: PositionSide,
    entry_price: Decimal,
    mark_price: Option<Decimal>,
    elapsed: Duration,
    trailing_extreme: &mut Option<Decimal>,
) -> Option<BarrierTrigger> {
    if let Some(trigger) = check_time_limit(config, elapsed) {
        return Some(trigger);
    }

    let mark = mark_price?;

    if let Some(trigger) = check_stop_loss(config, side, entry_price, mark) {
        return Some(trigger);
    }
    if let Some(trigger) = check_take_profit(config, side, entry_price, mark) {
        return Some(trigger);
    }
    check_trailing_stop(config, side, mark, trailing_extreme)
}

fn check_time_limit(config: &BarrierConfig, elapsed: Duration) -> Option<BarrierTrigger> {
    let limit = config.time_limit?;
    if elapsed >= limit {
        tracing::info!(limit_secs = limit.as_secs(), "Time limit barrier triggered");
        return Some(BarrierTrigger::TimeLimit);
    }
    None
}

fn check_stop_loss(
    config: &BarrierConfig,
    side: PositionSide,
    entry_price: Decimal,
    mark: Decimal,
) -> Option<BarrierTrigger> {
    let threshold = config.stop_loss_pct?;
    let pnl = pnl_pct(side, entry_price, mark)?;
    if pnl <= -threshold {
        tracing::warn!(pnl_pct = %pnl, threshold = %threshold, "Stop loss barrier triggered");
        return Some(BarrierTrigger::StopLoss);
    }
    None
}

fn check_take_profit(
    config: &BarrierConfig,
    side: PositionSide,
    entry_price: Decimal,
    mark: Decimal,
) -> Option<BarrierTrigger> {
    let threshold = config.take_profit_pct?;
    let pnl = pnl_pct(side, entry_price, mark)?;
    if pnl >= threshold {
        tracing::info!(pnl_pct = %pnl, threshold = %threshold, "Take profit barrier triggered");
        return Some(BarrierTrigger::TakeProfit);
    }
    None
}

fn check_trailing_stop(
    config: &BarrierConfig,
    side: PositionSide,
    mark: Decimal,
    trailing_extreme: &mut Option<Decimal>,
) -> Option<BarrierTrigger> {
    let threshold = config.trailing_stop_pct?;

    let extreme = match (side, *trailing_extreme) {
        (PositionSide::Long, Some(best)) => best.max(mark),
        (PositionSide::Short, Some(best)) => best.min(mark),
        (_, None) => mark,
    };
    *trailing_extreme = Some(extreme);

    if extreme.is_zero() {
        return None;
    }
    let retracement = match side {
        PositionSide::Long => (extreme - mark) / extreme * Decimal::from(100),
        PositionSide::Short => (mark - extreme) / extreme * Decimal::from(100),
    };
    if retracement >= threshold {
        tracing::info!(
            retracement_pct = %retracement,
            threshold = %threshold,
            "Trailing stop barrier triggered"
        );
        return Some(BarrierTrigger::TrailingStop);
    }
    None
}

/// Signed P&L percentage of the position at `mark`, relative to entry.
fn pnl_pct(side: PositionSide, entry_price: Decimal, mark: Decimal) -> Option<Decimal> {
    if entry_price.is_zero() {
        return None;
    }
    let raw = match side {
        PositionSide::Long => (mark - entry_price) / entry_price,
        PositionSide::Short => (entry_price - mark) / entry_price,
    };
    Some(raw * Decimal::from(100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn armed(
        time_limit: Option<u64>,
        sl: Option<Decimal>,
        tp: Option<Decimal>,
        trail: Option<Decimal>,
    ) -> BarrierConfig {
        BarrierConfig {
            time_limit: time_limit.map(Duration::from_secs),
            stop_loss_pct: sl,
            take_profit_pct: tp,
            trailing_stop_pct: trail,
        }
    }

    #[test]
    fn zero_time_limit_fires_immediately() {
        let config = armed(Some(0), None, None, None);
        let mut extreme = None;
        let trigger = check_barriers(
            &config,
            PositionSide::Long,
            dec!(50000),
            None,
            Duration::ZERO,
            &mut extreme,
        );
        assert_eq!(trigger, Some(BarrierTrigger::TimeLimit));
    }

    #[test]
    fn unarmed_config_never_triggers() {
        let config = BarrierConfig::default();
        let mut extreme = None;
        let trigger = check_barriers(
            &config,
            PositionSide::Long,
            dec!(50000),
            Some(dec!(10)),
            Duration::from_secs(3600),
            &mut extreme,
        );
        assert!(trigger.is_none());
    }

    #[test]
    fn stop_loss_triggers_at_threshold_for_longs() {
        let config = armed(None, Some(dec!(5)), None, None);
        let mut extreme = None;
        // Long from 100, marked at 94 — down 6%
        let trigger = check_barriers(
            &config,
            PositionSide::Long,
            dec!(100),
            Some(dec!(94)),
            Duration::ZERO,
            &mut extreme,
        );
        assert_eq!(trigger, Some(BarrierTrigger::StopLoss));
    }

    #[test]
    fn stop_loss_is_side_aware() {
        let config = armed(None, Some(dec!(5)), None, None);
        let mut extreme = None;
        // Short from 100, marked at 94 — that is a 6% gain, not a loss
        let trigger = check_barriers(
            &config,
            PositionSide::Short,
            dec!(100),
            Some(dec!(94)),
            Duration::ZERO,
            &mut extreme,
        );
        assert!(trigger.is_none());
    }

    #[test]
    fn take_profit_triggers_on_gains() {
        let config = armed(None, None, Some(dec!(3)), None);
        let mut extreme = None;
        let trigger = check_barriers(
            &config,
            PositionSide::Short,
            dec!(100),
            Some(dec!(96)),
            Duration::ZERO,
            &mut extreme,
        );
        assert_eq!(trigger, Some(BarrierTrigger::TakeProfit));
    }

    #[test]
    fn trailing_stop_tracks_the_peak() {
        let config = armed(None, None, None, Some(dec!(2)));
        let mut extreme = None;

        // Price runs up, no trigger
        for mark in [dec!(100), dec!(105), dec!(110)] {
            let trigger = check_barriers(
                &config,
                PositionSide::Long,
                dec!(100),
                Some(mark),
                Duration::ZERO,
                &mut extreme,
            );
            assert!(trigger.is_none());
        }
        assert_eq!(extreme, Some(dec!(110)));

        // 3% off the peak trips the 2% trail
        let trigger = check_barriers(
            &config,
            PositionSide::Long,
            dec!(100),
            Some(dec!(106.7)),
            Duration::ZERO,
            &mut extreme,
        );
        assert_eq!(trigger, Some(BarrierTrigger::TrailingStop));
    }

    #[test]
    fn price_barriers_need_a_mark_price() {
        let config = armed(None, Some(dec!(5)), Some(dec!(5)), Some(dec!(2)));
        let mut extreme = None;
        let trigger = check_barriers(
            &config,
            PositionSide::Long,
            dec!(100),
            None,
            Duration::ZERO,
            &mut extreme,
        );
        assert!(trigger.is_none());
    }
}
