//! # Adapters Layer (Hexagonal Architecture)
//!
//! Reference implementations of the outbound ports.

mod amount_math;
mod manual_timer;

pub use amount_math::BrandRegistry;
pub use manual_timer::ManualTimer;
