//! # Seat Ledger
//!
//! Owns every seat of one contract instance and applies reallocation
//! batches atomically.
//!
//! ## Reallocation
//!
//! A batch is checked in full before anything is written:
//!
//! 1. shape: one allocation per seat, no seat twice, every seat known
//! 2. every seat is Active
//! 3. every new allocation is offer safe for its seat's proposal
//! 4. per-brand totals across the batch are conserved (or change by exactly
//!    the declared supply delta)
//!
//! Only then are all allocations replaced. A failed check leaves the ledger
//! untouched.
//!
//! ## Supply
//!
//! The ledger tracks the total escrowed per brand: deposits and mints add,
//! payouts and burns subtract. `audit` compares it against the sum over
//! Active seats.

use crate::algorithms::{
    accumulate, check_conservation, is_offer_safe, totals_by_brand, BrandTotals, SupplyDelta,
};
use crate::domain::{
    invariant_batch_lengths, invariant_batch_size, invariant_distinct_seats,
    invariant_seat_active, Allocation, Amount, EscrowError, ExitCause, Proposal, Seat, SeatId,
};
use crate::ports::outbound::AssetSink;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Receiver resolved with the payout once the seat exits.
pub type PayoutReceiver = watch::Receiver<Option<Allocation>>;

/// State that must survive an instance restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Every seat, active or exited.
    pub seats: Vec<Seat>,
    /// Next seat number to hand out.
    pub next_seat: u64,
    /// Escrowed total per brand.
    pub supply: Vec<Amount>,
}

/// Per-instance seat ledger.
pub struct SeatLedger {
    seats: BTreeMap<SeatId, Seat>,
    payouts: HashMap<SeatId, watch::Sender<Option<Allocation>>>,
    supply: BrandTotals,
    next_seat: u64,
}

impl Default for SeatLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl SeatLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            seats: BTreeMap::new(),
            payouts: HashMap::new(),
            supply: BrandTotals::new(),
            next_seat: 1,
        }
    }

    /// Rebuild a ledger from a snapshot.
    ///
    /// Exited seats have their payout available immediately.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let mut ledger = Self::new();
        ledger.next_seat = snapshot.next_seat;
        ledger.supply = snapshot
            .supply
            .into_iter()
            .map(|a| (a.brand.clone(), a))
            .collect();
        for seat in snapshot.seats {
            let payout = (!seat.is_active()).then(|| seat.allocation.clone());
            let (sender, _) = watch::channel(payout);
            ledger.payouts.insert(seat.id, sender);
            ledger.next_seat = ledger.next_seat.max(seat.id.0 + 1);
            ledger.seats.insert(seat.id, seat);
        }
        ledger
    }

    /// Capture the ledger state.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            seats: self.seats.values().cloned().collect(),
            next_seat: self.next_seat,
            supply: self.supply.values().cloned().collect(),
        }
    }

    /// Number of seats, active or exited.
    pub fn len(&self) -> usize {
        self.seats.len()
    }

    /// Check if the ledger holds no seat.
    pub fn is_empty(&self) -> bool {
        self.seats.is_empty()
    }

    /// Ids of Active seats.
    pub fn active_seats(&self) -> Vec<SeatId> {
        self.seats
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.id)
            .collect()
    }

    /// Escrowed total per brand.
    pub fn supply(&self) -> &BrandTotals {
        &self.supply
    }

    /// Look up a seat.
    pub fn seat(&self, id: SeatId) -> Result<&Seat, EscrowError> {
        self.seats.get(&id).ok_or(EscrowError::SeatNotFound(id))
    }

    /// Current allocation of a seat (its payout once exited).
    pub fn current_allocation(&self, id: SeatId) -> Result<Allocation, EscrowError> {
        self.seat(id).map(|s| s.allocation.clone())
    }

    /// Subscribe to a seat's payout.
    pub fn subscribe_payout(&self, id: SeatId) -> Result<PayoutReceiver, EscrowError> {
        self.payouts
            .get(&id)
            .map(watch::Sender::subscribe)
            .ok_or(EscrowError::SeatNotFound(id))
    }

    /// Add a seat holding `escrow`.
    ///
    /// The escrow must cover the proposal's `give` for every keyword, and
    /// the new seat must be offer safe as it stands.
    pub fn add_seat(
        &mut self,
        sink: &dyn AssetSink,
        proposal: Proposal,
        escrow: Allocation,
    ) -> Result<(SeatId, PayoutReceiver), EscrowError> {
        for (keyword, required) in &proposal.give {
            // A held amount of another brand or kind does not cover.
            let covered = escrow
                .get(keyword)
                .is_some_and(|held| sink.is_gte(held, required).unwrap_or(false));
            if !covered {
                return Err(EscrowError::EscrowShortfall {
                    keyword: keyword.to_string(),
                });
            }
        }
        if !is_offer_safe(sink, &proposal, &escrow) {
            return Err(EscrowError::EscrowNotOfferSafe {
                multiples: proposal.multiples,
            });
        }

        let mut supply = self.supply.clone();
        for amount in escrow.values() {
            sink.coerce(&amount.brand, amount.value.clone())?;
            accumulate(sink, &mut supply, amount)?;
        }

        let id = SeatId(self.next_seat);
        self.next_seat += 1;
        self.supply = supply;

        let (sender, receiver) = watch::channel(None);
        self.payouts.insert(id, sender);
        self.seats.insert(id, Seat::new(id, proposal, escrow));

        debug!(seat = %id, "[qc-18] Seat added to ledger");
        Ok((id, receiver))
    }

    /// Validate and commit a reallocation batch.
    pub fn reallocate(
        &mut self,
        sink: &dyn AssetSink,
        seat_ids: &[SeatId],
        allocations: Vec<Allocation>,
        delta: &SupplyDelta,
        max_batch_size: usize,
    ) -> Result<(), EscrowError> {
        invariant_batch_lengths(seat_ids.len(), allocations.len())?;
        invariant_batch_size(seat_ids.len(), max_batch_size)?;
        invariant_distinct_seats(seat_ids)?;

        let seats = seat_ids
            .iter()
            .map(|id| self.seat(*id))
            .collect::<Result<Vec<_>, _>>()?;

        for seat in &seats {
            invariant_seat_active(seat)?;
        }

        for (seat, allocation) in seats.iter().zip(&allocations) {
            if !is_offer_safe(sink, &seat.proposal, allocation) {
                warn!(seat = %seat.id, "[qc-18] Proposed allocation is not offer safe");
                return Err(EscrowError::OfferUnsafe { seat: seat.id });
            }
        }

        let before = totals_by_brand(sink, seats.iter().map(|s| &s.allocation))?;
        let after = totals_by_brand(sink, &allocations)?;
        check_conservation(sink, &before, &after, delta)?;

        let supply = self.supply_after(sink, delta)?;

        // Commit: every check passed, nothing below can fail halfway.
        for (id, allocation) in seat_ids.iter().zip(allocations) {
            if let Some(seat) = self.seats.get_mut(id) {
                seat.replace_allocation(allocation)?;
            }
        }
        self.supply = supply;

        debug!(seats = seat_ids.len(), "[qc-18] Reallocation committed");
        Ok(())
    }

    fn supply_after(
        &self,
        sink: &dyn AssetSink,
        delta: &SupplyDelta,
    ) -> Result<BrandTotals, EscrowError> {
        let mut supply = self.supply.clone();
        for minted in &delta.minted {
            accumulate(sink, &mut supply, minted)?;
        }
        for burned in &delta.burned {
            let current = match supply.get(&burned.brand) {
                Some(current) => current.clone(),
                None => sink.make_empty(&burned.brand)?,
            };
            let rest = sink
                .subtract(&current, burned)
                .map_err(|_| EscrowError::Conservation {
                    brand: burned.brand.clone(),
                })?;
            supply.insert(burned.brand.clone(), rest);
        }
        Ok(supply)
    }

    /// Exit a seat, freezing its allocation as the payout.
    ///
    /// Returns `Ok(None)` if the seat had already exited. The payout is
    /// delivered even when the supply bookkeeping then reports a violation.
    pub fn exit_seat(
        &mut self,
        sink: &dyn AssetSink,
        id: SeatId,
        cause: ExitCause,
    ) -> Result<Option<Allocation>, EscrowError> {
        let seat = self.seats.get_mut(&id).ok_or(EscrowError::SeatNotFound(id))?;
        let Some(payout) = seat.exit(cause) else {
            return Ok(None);
        };

        if let Some(sender) = self.payouts.get(&id) {
            sender.send_replace(Some(payout.clone()));
        }
        debug!(seat = %id, "[qc-18] Seat exited, payout frozen");

        for amount in payout.values() {
            let Some(current) = self.supply.get(&amount.brand) else {
                continue;
            };
            match sink.subtract(current, amount) {
                Ok(rest) => {
                    self.supply.insert(amount.brand.clone(), rest);
                }
                Err(e) => {
                    return Err(EscrowError::InvariantViolation(format!(
                        "payout of {id} exceeds escrowed supply: {e}"
                    )))
                }
            }
        }
        Ok(Some(payout))
    }

    /// Re-check the ledger after a commit.
    ///
    /// Totals over Active seats must equal the tracked supply, and every
    /// seat in `touched` that is still Active must be offer safe.
    pub fn audit(&self, sink: &dyn AssetSink, touched: &[SeatId]) -> Result<(), EscrowError> {
        let held = totals_by_brand(
            sink,
            self.seats
                .values()
                .filter(|s| s.is_active())
                .map(|s| &s.allocation),
        )
        .map_err(|e| EscrowError::InvariantViolation(e.to_string()))?;

        check_conservation(sink, &self.supply, &held, &SupplyDelta::default()).map_err(|e| {
            EscrowError::InvariantViolation(format!("escrowed supply drifted: {e}"))
        })?;

        for id in touched {
            let seat = self.seat(*id)?;
            if seat.is_active() && !is_offer_safe(sink, &seat.proposal, &seat.allocation) {
                return Err(EscrowError::InvariantViolation(format!(
                    "seat {id} is not offer safe after commit"
                )));
            }
        }
        Ok(())
    }

    /// Overwrite a seat's allocation without any check.
    #[cfg(test)]
    pub(crate) fn corrupt_allocation(&mut self, id: SeatId, allocation: Allocation) {
        if let Some(seat) = self.seats.get_mut(&id) {
            seat.allocation = allocation;
        }
    }
}
