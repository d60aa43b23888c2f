//! # Outbound Ports
//!
//! Traits for external collaborators: amount arithmetic and timers.
//!
//! Both are synchronous. The escrow core never waits on them inside a turn;
//! a timer delivers its wakeup later through the instance's wakeup queue.

use crate::domain::{Amount, AmountError, AmountValue, AssetKind, Brand, Timestamp};
use std::sync::Arc;

/// Per-brand amount arithmetic - outbound port.
///
/// Every operation is keyed by the brand of its operands; amounts of
/// different brands are never compared.
pub trait AssetSink: Send + Sync {
    /// Kind declared for a brand, `None` if unregistered.
    fn asset_kind(&self, brand: &Brand) -> Option<AssetKind>;

    /// Validate a raw magnitude against the brand's kind.
    fn coerce(&self, brand: &Brand, raw: AmountValue) -> Result<Amount, AmountError>;

    /// Empty amount of a brand.
    fn make_empty(&self, brand: &Brand) -> Result<Amount, AmountError>;

    /// Check if an amount is empty.
    fn is_empty(&self, amount: &Amount) -> Result<bool, AmountError>;

    /// `left >= right`.
    fn is_gte(&self, left: &Amount, right: &Amount) -> Result<bool, AmountError>;

    /// `left + right`.
    fn add(&self, left: &Amount, right: &Amount) -> Result<Amount, AmountError>;

    /// `left - right`; fails if `right` is not contained in `left`.
    fn subtract(&self, left: &Amount, right: &Amount) -> Result<Amount, AmountError>;

    /// `left == right`.
    fn is_equal(&self, left: &Amount, right: &Amount) -> Result<bool, AmountError> {
        Ok(self.is_gte(left, right)? && self.is_gte(right, left)?)
    }
}

/// Callback receiving a timer wakeup.
pub trait TimerWaker: Send + Sync {
    /// Deliver a wakeup; may be called more than once.
    fn wake(&self, timestamp: Timestamp);
}

/// Timer service - outbound port.
///
/// Delivers at-least-once wakeups at or after the requested timestamp.
pub trait TimerService: Send + Sync {
    /// Current timestamp of this timer.
    fn current_timestamp(&self) -> Timestamp;

    /// Schedule a wakeup. Returns the timestamp it was scheduled for.
    fn set_wakeup(&self, deadline: Timestamp, waker: Arc<dyn TimerWaker>) -> Timestamp;

    /// Cancel every pending wakeup of this waker. Returns the timestamps removed.
    fn remove_wakeup(&self, waker: &Arc<dyn TimerWaker>) -> Vec<Timestamp>;
}
