//! Hedge orchestration.
//!
//! Contains the core logic for:
//! - Hedge opportunity records shared with signal producers
//! - Opening and closing both legs of a hedge across exchanges
//! - Single-order intents with amend-or-create semantics

mod coordinator;
mod executor;
mod opportunity;

pub use coordinator::{CoordinatorConfig, HedgeOrderCoordinator, HedgeOutcome};
pub use executor::{ExecutorConfig, OrderExecutor, OrderIntent};
pub use opportunity::{
    DriveGuard, HedgeFailure, HedgeOpportunity, HedgeState, Leg, LegRole, LegStatus,
    OpportunityHandle, PairRef, Signal,
};
