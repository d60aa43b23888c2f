//! # Domain Invariants
//!
//! Business rules checked before a reallocation batch touches the ledger.

use super::entities::Seat;
use super::errors::EscrowError;
use super::value_objects::{ExitRule, SeatId};
use std::collections::BTreeSet;

/// Invariant: One allocation per seat.
pub fn invariant_batch_lengths(seats: usize, allocations: usize) -> Result<(), EscrowError> {
    if seats != allocations {
        return Err(EscrowError::LengthMismatch { seats, allocations });
    }
    Ok(())
}

/// Invariant: Batch no larger than configured.
pub fn invariant_batch_size(size: usize, max: usize) -> Result<(), EscrowError> {
    if size > max {
        return Err(EscrowError::BatchTooLarge { size, max });
    }
    Ok(())
}

/// Invariant: A seat appears at most once per batch.
///
/// Two allocations for one seat would make the commit order-dependent.
pub fn invariant_distinct_seats(seats: &[SeatId]) -> Result<(), EscrowError> {
    let mut seen = BTreeSet::new();
    for seat in seats {
        if !seen.insert(*seat) {
            return Err(EscrowError::DuplicateSeatInBatch(*seat));
        }
    }
    Ok(())
}

/// Invariant: Exited seats are immutable.
pub fn invariant_seat_active(seat: &Seat) -> Result<(), EscrowError> {
    if !seat.is_active() {
        return Err(EscrowError::SeatAlreadyExited { seat: seat.id });
    }
    Ok(())
}

/// Invariant: Only `onDemand` seats may be exited by their holder.
pub fn invariant_holder_may_exit(seat: &Seat) -> Result<(), EscrowError> {
    match seat.proposal.exit {
        ExitRule::OnDemand => Ok(()),
        ref rule => Err(EscrowError::ExitNotAllowed {
            seat: seat.id,
            rule: rule.name().to_string(),
        }),
    }
}
