//! Shared pending-close bookkeeping.
//!
//! Multiple closing processes may target the same underlying venue position
//! (two assignments on one pair before the first finishes closing). The
//! ledger tracks how much of each position is already claimed by in-flight
//! reducing orders so no process ever closes more than what is actually
//! outstanding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rust_decimal::Decimal;

type LedgerKey = (String, String);
type LedgerMap = Arc<Mutex<HashMap<LedgerKey, Decimal>>>;

/// Per-(connector, trading pair) reserved close amounts.
///
/// Cheap to clone; all clones share the same ledger.
#[derive(Clone, Default)]
pub struct PendingCloseLedger {
    inner: LedgerMap,
}

impl PendingCloseLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve up to `requested` of the live position, capped by what other
    /// processes have already claimed.
    ///
    /// Returns `None` when nothing is left to claim. The reservation is
    /// released when the returned guard drops, on every exit path.
    #[must_use]
    pub fn reserve(
        &self,
        connector_id: &str,
        trading_pair: &str,
        requested: Decimal,
        live_position: Decimal,
    ) -> Option<CloseReservation> {
        if requested <= Decimal::ZERO || live_position <= Decimal::ZERO {
            return None;
        }
        let key = (connector_id.to_string(), trading_pair.to_string());
        let mut map = self.lock();
        let pending = map.get(&key).copied().unwrap_or_default();
        let headroom = live_position - pending;
        if headroom <= Decimal::ZERO {
            return None;
        }
        let granted = requested.min(headroom);
        *map.entry(key.clone()).or_default() += granted;
        drop(map);

        Some(CloseReservation {
            ledger: Arc::clone(&self.inner),
            key,
            amount: granted,
        })
    }

    /// Total amount currently reserved against a pair.
    #[must_use]
    pub fn pending(&self, connector_id: &str, trading_pair: &str) -> Decimal {
        let key = (connector_id.to_string(), trading_pair.to_string());
        self.lock().get(&key).copied().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<LedgerKey, Decimal>> {
        // Lock is never held across an await and a poisoned map is still
        // internally consistent, so recover rather than propagate.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A claim on part of a live position, released on drop.
pub struct CloseReservation {
    ledger: LedgerMap,
    key: LedgerKey,
    amount: Decimal,
}

impl CloseReservation {
    /// The amount actually granted, which may be less than requested.
    #[must_use]
    pub const fn amount(&self) -> Decimal {
        self.amount
    }
}

impl Drop for CloseReservation {
    fn drop(&mut self) {
        let mut map = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = map.get_mut(&self.key) {
            *pending -= self.amount;
            if *pending <= Decimal::ZERO {
                map.remove(&self.key);
            }
        }
    }
}
