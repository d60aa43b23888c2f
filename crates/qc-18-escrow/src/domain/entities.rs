//! # Domain Entities
//!
//! Proposals and seats.

use super::errors::EscrowError;
use super::value_objects::{
    Amount, AmountPattern, ExitCause, ExitRule, Keyword, SeatId, SeatState,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Keyword -> Amount record (give, allocation, payout).
pub type Allocation = BTreeMap<Keyword, Amount>;

/// Keyword -> pattern record (want).
pub type WantRecord = BTreeMap<Keyword, AmountPattern>;

/// Canonical proposal produced by `clean_proposal`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// What the party escrows.
    pub give: Allocation,
    /// What the party asks for.
    pub want: WantRecord,
    /// Exit policy.
    pub exit: ExitRule,
    /// How many times give+want must be satisfied in total.
    pub multiples: u64,
}

impl Default for Proposal {
    fn default() -> Self {
        Self {
            give: Allocation::new(),
            want: WantRecord::new(),
            exit: ExitRule::OnDemand,
            multiples: 1,
        }
    }
}

impl Proposal {
    /// Raw record form accepted by `clean_proposal`.
    pub fn to_value(&self) -> Value {
        let give: Map<String, Value> = self
            .give
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_value()))
            .collect();
        let want: Map<String, Value> = self
            .want
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_value()))
            .collect();

        let mut raw = Map::new();
        raw.insert("give".into(), Value::Object(give));
        raw.insert("want".into(), Value::Object(want));
        raw.insert("exit".into(), self.exit.to_value());
        raw.insert("multiples".into(), Value::from(self.multiples));
        Value::Object(raw)
    }
}

/// Escrow record for one party in one contract instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    /// Identifier within the instance.
    pub id: SeatId,
    /// Cleaned proposal.
    pub proposal: Proposal,
    /// Current allocation (payout once exited).
    pub allocation: Allocation,
    /// Lifecycle state.
    pub state: SeatState,
    /// Set once the seat exits.
    pub exit_cause: Option<ExitCause>,
}

impl Seat {
    /// Create an active seat holding the escrowed allocation.
    pub fn new(id: SeatId, proposal: Proposal, allocation: Allocation) -> Self {
        Self {
            id,
            proposal,
            allocation,
            state: SeatState::Active,
            exit_cause: None,
        }
    }

    /// Check if the seat may still be reallocated.
    pub fn is_active(&self) -> bool {
        self.state == SeatState::Active
    }

    /// Replace the allocation of an active seat.
    pub(crate) fn replace_allocation(&mut self, allocation: Allocation) -> Result<(), EscrowError> {
        if !self.is_active() {
            return Err(EscrowError::SeatAlreadyExited { seat: self.id });
        }
        self.allocation = allocation;
        Ok(())
    }

    /// Freeze the allocation as payout.
    ///
    /// Returns the payout on the Active -> Exited transition, `None` if the
    /// seat had already exited.
    pub(crate) fn exit(&mut self, cause: ExitCause) -> Option<Allocation> {
        if !self.state.can_transition_to(SeatState::Exited) {
            return None;
        }
        self.state = SeatState::Exited;
        self.exit_cause = Some(cause);
        Some(self.allocation.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::Brand;

    fn kw(name: &str) -> Keyword {
        Keyword::new(name).unwrap()
    }

    fn create_test_seat() -> Seat {
        let moola = Brand::new("moola");
        let mut give = Allocation::new();
        give.insert(kw("Price"), Amount::count(&moola, 10));
        let proposal = Proposal {
            give: give.clone(),
            ..Default::default()
        };
        Seat::new(SeatId(1), proposal, give)
    }

    #[test]
    fn test_seat_new_is_active() {
        let seat = create_test_seat();
        assert!(seat.is_active());
        assert!(seat.exit_cause.is_none());
    }

    #[test]
    fn test_seat_exit_returns_payout_once() {
        let mut seat = create_test_seat();
        let payout = seat.exit(ExitCause::Voluntary);
        assert_eq!(payout, Some(seat.allocation.clone()));
        assert_eq!(seat.state, SeatState::Exited);

        // Second exit is a no-op and keeps the first cause.
        assert!(seat.exit(ExitCause::ContractForced).is_none());
        assert_eq!(seat.exit_cause, Some(ExitCause::Voluntary));
    }

    #[test]
    fn test_exited_seat_rejects_replace() {
        let mut seat = create_test_seat();
        seat.exit(ExitCause::ContractForced);
        let result = seat.replace_allocation(Allocation::new());
        assert!(matches!(result, Err(EscrowError::SeatAlreadyExited { .. })));
        assert!(!seat.allocation.is_empty());
    }

    #[test]
    fn test_default_proposal_raw_form() {
        let raw = Proposal::default().to_value();
        assert_eq!(
            raw,
            serde_json::json!({
                "give": {},
                "want": {},
                "exit": { "onDemand": null },
                "multiples": 1,
            })
        );
    }

    #[test]
    fn test_raw_form_keeps_multiples() {
        let proposal = Proposal {
            multiples: 2,
            ..Default::default()
        };
        assert_eq!(proposal.to_value()["multiples"], serde_json::json!(2));
    }
}
