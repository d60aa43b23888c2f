//! # QC-18 Offer-Safe Escrow
//!
//! Escrow and atomic reallocation of assets between mutually distrusting
//! parties, with guarantees that hold whatever the contract logic does.
//!
//! **Subsystem ID:** 18
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Purpose
//!
//! Parties escrow assets with a contract instance and receive, on exit,
//! either a full refund of what they gave or everything they wanted:
//! - proposals are validated and canonicalized before anything is escrowed
//! - every reallocation is checked for offer safety and per-brand
//!   conservation, and commits all-or-nothing
//! - exit rules (on demand, waived, after deadline) decide when a seat's
//!   allocation is frozen as its payout
//! - invitations are single-use, unforgeable capabilities
//!
//! ## Guarantees
//!
//! | Guarantee | Enforced by |
//! |-----------|-------------|
//! | Offer safety | `is_offer_safe` on every seat of every batch |
//! | Conservation | per-brand totals before == after (or exact mint/burn) |
//! | Atomicity | all checks run before any allocation is replaced |
//! | Exit immutability | exited seats are rejected by `reallocate` |
//! | Single-use invitations | redeem removes the handler |
//! | Fail-stop | post-commit audit halts the instance |
//!
//! ## Module Structure
//!
//! ```text
//! qc-18-escrow/
//! ├── domain/          # Amount, Keyword, Proposal, Seat, errors, invariants
//! ├── algorithms/      # clean_proposal, offer safety, conservation
//! ├── ports/           # EscrowApi, AssetSink, TimerService
//! ├── adapters/        # BrandRegistry, ManualTimer
//! ├── ledger.rs        # SeatLedger: seats, supply, atomic reallocation
//! ├── exit.rs          # ExitRuleStateMachine
//! ├── invitations.rs   # InvitationHandle, OfferHandlerRegistry
//! ├── instance.rs      # ContractInstance, ContractFacet, UserSeat
//! └── runtime.rs       # per-instance executor and handles
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod algorithms;
pub mod config;
pub mod domain;
pub mod events;
pub mod exit;
pub mod instance;
pub mod invitations;
pub mod ledger;
pub mod ports;
pub mod runtime;

// Re-exports
pub use adapters::{BrandRegistry, ManualTimer};
pub use algorithms::{
    check_conservation, clean_proposal, is_offer_safe, satisfies, satisfies_give,
    satisfies_want, totals_by_brand, BrandTotals, SupplyDelta,
};
pub use config::EscrowConfig;
pub use domain::{
    is_valid_keyword, Allocation, Amount, AmountError, AmountPattern, AmountValue, AssetKind,
    Brand, EscrowError, ExitCause, ExitRule, InstanceId, Keyword, Proposal, Seat, SeatId,
    SeatState, TimerRef, Timestamp, WantRecord,
};
pub use events::{EscrowEvent, EscrowStats};
pub use exit::{ExitRuleStateMachine, Wakeup};
pub use instance::{
    ContractFacet, ContractInstance, ExitKey, InstanceSnapshot, MintAuthority, UserSeat,
};
pub use invitations::{
    InvitationDetails, InvitationHandle, OfferHandler, OfferHandlerRegistry, RedeemedInvitation,
};
pub use ledger::{LedgerSnapshot, PayoutReceiver, SeatLedger};
pub use ports::{AssetSink, EscrowApi, TimerService, TimerWaker};
pub use runtime::{spawn_instance, ContractHandle, EscrowHandle};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
