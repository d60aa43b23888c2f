//! # Algorithms Module
//!
//! Pure checks run before any escrow or reallocation: proposal cleaning,
//! offer safety and conservation.

pub mod clean_proposal;
pub mod conservation;
pub mod offer_safety;

pub use clean_proposal::{clean_proposal, parse_amount};
pub use conservation::{
    accumulate, check_conservation, totals_by_brand, BrandTotals, SupplyDelta,
};
pub use offer_safety::{is_offer_safe, satisfies, satisfies_give, satisfies_want};
