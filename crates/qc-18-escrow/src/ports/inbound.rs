//! # Inbound Ports
//!
//! API trait defining what a party to a contract instance can do.
//!
//! Reallocation and invitation minting are not here: they belong to the
//! contract logic and are reached only through `ContractFacet`.

use crate::domain::{Allocation, EscrowError, Proposal, SeatId};
use crate::events::EscrowStats;
use crate::instance::UserSeat;
use crate::invitations::{InvitationDetails, InvitationHandle};
use async_trait::async_trait;
use serde_json::Value;

/// Escrow API - inbound port.
#[async_trait]
pub trait EscrowApi: Send + Sync {
    /// Redeem an invitation, escrow `escrow` under `proposal` and run the
    /// contract's handler.
    async fn offer(
        &self,
        invitation: InvitationHandle,
        proposal: Value,
        escrow: Allocation,
    ) -> Result<UserSeat, EscrowError>;

    /// Describe an invitation without redeeming it.
    async fn invitation_details(
        &self,
        invitation: &InvitationHandle,
    ) -> Result<InvitationDetails, EscrowError>;

    /// Current allocation of a seat.
    async fn current_allocation(&self, seat: SeatId) -> Result<Allocation, EscrowError>;

    /// Cleaned proposal of a seat.
    async fn proposal(&self, seat: SeatId) -> Result<Proposal, EscrowError>;

    /// Holder exit; allowed for `onDemand` seats only.
    async fn exit(&self, seat: &UserSeat) -> Result<Allocation, EscrowError>;

    /// Instance statistics.
    async fn stats(&self) -> Result<EscrowStats, EscrowError>;
}
