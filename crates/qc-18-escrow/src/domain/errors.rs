//! # Domain Errors
//!
//! Error types for the escrow engine.
//!
//! Proposal errors are raised before any asset is escrowed. Reallocation
//! errors abort the whole batch with no partial mutation.

use super::value_objects::{Brand, SeatId};
use thiserror::Error;

/// Errors from amount arithmetic (the `AssetSink` boundary).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    /// Brand was never registered with the sink.
    #[error("unknown brand: {0}")]
    UnknownBrand(Brand),

    /// Two amounts of different brands were combined.
    #[error("brand mismatch: {left} vs {right}")]
    BrandMismatch {
        /// Brand of the left operand
        left: Brand,
        /// Brand of the right operand
        right: Brand,
    },

    /// Magnitude shape does not match the brand's asset kind.
    #[error("value of brand {brand} is not of kind {expected}")]
    KindMismatch {
        /// Brand of the offending amount
        brand: Brand,
        /// Kind the brand was registered with
        expected: String,
    },

    /// Subtraction would go below empty.
    #[error("cannot subtract: right operand is not contained in left ({brand})")]
    Underflow {
        /// Brand of the operands
        brand: Brand,
    },

    /// Addition overflowed the magnitude type.
    #[error("amount overflow for brand {0}")]
    Overflow(Brand),

    /// Set union found an element on both sides.
    #[error("set element {element:?} appears twice for brand {brand}")]
    DuplicateElement {
        /// Brand of the operands
        brand: Brand,
        /// Element present in both sets
        element: String,
    },
}

/// Escrow engine error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EscrowError {
    /// Raw proposal is not record-shaped or contains an invalid keyword/amount.
    #[error("proposal shape: {0}")]
    ProposalShape(String),

    /// A keyword appears in both `give` and `want`.
    #[error("a keyword cannot be in both 'want' and 'give': {0}")]
    DuplicateKeyword(String),

    /// Amount kind differs from the kind declared for its brand.
    #[error("the amount {value} did not have the assetKind of the brand {brand} ({expected})")]
    AssetKindMismatch {
        /// Brand of the amount
        brand: Brand,
        /// Kind declared for the brand
        expected: String,
        /// Rendering of the offending value
        value: String,
    },

    /// Exit rule malformed.
    #[error("exit shape: {0}")]
    ExitShape(String),

    /// Brand not known to the asset sink.
    #[error("unknown brand: {0}")]
    UnknownBrand(Brand),

    /// Proposal names a timer that the instance does not know.
    #[error("unknown timer: {0}")]
    UnknownTimer(String),

    /// New allocation for a seat is not offer safe.
    #[error("offer safety was violated by the proposed allocation for seat {seat}")]
    OfferUnsafe {
        /// Seat whose allocation was rejected
        seat: SeatId,
    },

    /// Per-brand totals differ before and after a reallocation.
    #[error("rights were not conserved for brand {brand}")]
    Conservation {
        /// Brand whose totals differ
        brand: Brand,
    },

    /// Seat already exited; its allocation is frozen.
    #[error("seat {seat} has already exited")]
    SeatAlreadyExited {
        /// Exited seat
        seat: SeatId,
    },

    /// Seat id not present in this instance's ledger.
    #[error("seat not found: {0}")]
    SeatNotFound(SeatId),

    /// Seats and allocations differ in length.
    #[error("reallocate expects one allocation per seat: {seats} seats, {allocations} allocations")]
    LengthMismatch {
        /// Number of seats named
        seats: usize,
        /// Number of allocations supplied
        allocations: usize,
    },

    /// The same seat is named twice in one batch.
    #[error("seat {0} appears more than once in a reallocation")]
    DuplicateSeatInBatch(SeatId),

    /// Batch exceeds the configured size.
    #[error("reallocation batch too large: {size} > {max}")]
    BatchTooLarge {
        /// Seats in the batch
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Escrowed assets do not cover the proposal's `give`.
    #[error("escrowed assets do not cover 'give' for keyword {keyword}")]
    EscrowShortfall {
        /// Keyword not covered
        keyword: String,
    },

    /// Escrowed assets would leave the new seat unsafe from the start.
    #[error("escrowed assets are not offer safe for multiples {multiples}")]
    EscrowNotOfferSafe {
        /// Coverings the proposal requires
        multiples: u64,
    },

    /// Invitation handle unknown or already redeemed.
    #[error("invitation not found")]
    InvitationNotFound,

    /// Holder exit attempted on a seat whose exit rule forbids it.
    #[error("only seats with the exit rule \"onDemand\" may exit, seat {seat} has {rule}")]
    ExitNotAllowed {
        /// Seat that attempted exit
        seat: SeatId,
        /// Name of the seat's exit rule
        rule: String,
    },

    /// Exit key does not belong to the seat.
    #[error("caller does not hold seat {0}")]
    NotSeatHolder(SeatId),

    /// Mint/burn declared for a brand outside the authority's scope.
    #[error("mint authority does not cover brand {0}")]
    MintNotAuthorized(Brand),

    /// Post-commit audit detected broken conservation or safety.
    #[error("invariant violation after commit: {0}")]
    InvariantViolation(String),

    /// Instance stopped accepting reallocations after a fatal violation.
    #[error("instance halted: {0}")]
    InstanceHalted(String),

    /// Contract handler failed for this offer.
    #[error("offer handler failed: {0}")]
    HandlerFailed(String),

    /// Amount arithmetic error.
    #[error("amount error: {0}")]
    Amount(#[from] AmountError),

    /// The instance executor is gone.
    #[error("instance executor closed")]
    ExecutorClosed,
}

impl EscrowError {
    /// Returns true if the caller may correct its input and retry.
    ///
    /// Fatal errors mean the instance can no longer be trusted with
    /// further reallocations.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::InvariantViolation(_) | Self::InstanceHalted(_) | Self::ExecutorClosed
        )
    }

    /// Returns true if this error was raised while cleaning a proposal.
    #[must_use]
    pub fn is_proposal_error(&self) -> bool {
        matches!(
            self,
            Self::ProposalShape(_)
                | Self::DuplicateKeyword(_)
                | Self::AssetKindMismatch { .. }
                | Self::ExitShape(_)
                | Self::UnknownBrand(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_unsafe_names_seat() {
        let err = EscrowError::OfferUnsafe { seat: SeatId(7) };
        assert!(err.to_string().contains("seat-7"));
    }

    #[test]
    fn test_conservation_names_brand() {
        let err = EscrowError::Conservation {
            brand: Brand::new("moola"),
        };
        assert!(err.to_string().contains("moola"));
    }

    #[test]
    fn test_fatal_errors_not_recoverable() {
        assert!(!EscrowError::InvariantViolation("x".into()).is_recoverable());
        assert!(!EscrowError::InstanceHalted("x".into()).is_recoverable());
        assert!(EscrowError::SeatAlreadyExited { seat: SeatId(1) }.is_recoverable());
        assert!(EscrowError::InvitationNotFound.is_recoverable());
    }

    #[test]
    fn test_proposal_error_classification() {
        assert!(EscrowError::DuplicateKeyword("Asset".into()).is_proposal_error());
        assert!(EscrowError::ExitShape("x".into()).is_proposal_error());
        assert!(!EscrowError::OfferUnsafe { seat: SeatId(1) }.is_proposal_error());
    }

    #[test]
    fn test_amount_error_converts() {
        let err: EscrowError = AmountError::Overflow(Brand::new("moola")).into();
        assert!(matches!(err, EscrowError::Amount(_)));
    }
}
