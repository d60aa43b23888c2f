//! # Escrow Events
//!
//! Notifications broadcast by a contract instance. Observers only ever see
//! post-commit state.

use crate::domain::{Allocation, ExitCause, InstanceId, SeatId};
use serde::{Deserialize, Serialize};

/// Event emitted by a contract instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowEvent {
    /// A seat was created holding its escrow.
    SeatCreated {
        /// Emitting instance
        instance: InstanceId,
        /// New seat
        seat: SeatId,
    },
    /// A committed reallocation changed a seat's allocation.
    AllocationChanged {
        /// Emitting instance
        instance: InstanceId,
        /// Reallocated seat
        seat: SeatId,
        /// Allocation after the commit
        allocation: Allocation,
    },
    /// A seat exited and its payout was frozen.
    SeatExited {
        /// Emitting instance
        instance: InstanceId,
        /// Exited seat
        seat: SeatId,
        /// Why the seat exited
        cause: ExitCause,
        /// Frozen payout
        payout: Allocation,
    },
    /// An invitation was issued.
    InvitationMinted {
        /// Emitting instance
        instance: InstanceId,
        /// Invitation description
        description: String,
    },
    /// A reallocation batch was rejected with no change.
    ReallocationRejected {
        /// Emitting instance
        instance: InstanceId,
        /// Rejection reason
        reason: String,
    },
    /// The instance stopped accepting reallocations.
    InstanceHalted {
        /// Emitting instance
        instance: InstanceId,
        /// Violation detected
        reason: String,
    },
}

/// Escrow instance statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EscrowStats {
    /// Offers accepted (seats created through an invitation).
    pub offers_made: u64,
    /// Seats created.
    pub seats_created: u64,
    /// Reallocation batches committed.
    pub reallocations_committed: u64,
    /// Reallocation batches rejected.
    pub reallocations_rejected: u64,
    /// Seats exited.
    pub seats_exited: u64,
    /// Invitations minted.
    pub invitations_minted: u64,
    /// Invitations redeemed.
    pub invitations_redeemed: u64,
    /// Offer handlers that failed.
    pub handler_failures: u64,
}
