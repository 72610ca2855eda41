//! Ordered operation plans for lending actions.
//!
//! A plan is assembled in phases (compute budget, setup, lending, in-between,
//! cleanup) and flattened into one instruction list that must execute in
//! order. All account-existence questions go through a `LedgerReader`.

pub mod builder;
pub mod plan;
pub mod support;

pub use builder::set_obligation_order_ix;
pub use plan::{
    ActionOptions, ActionPlan, ObligationSource, ObligationType, Phase, PlannedOperation, TokenLeg,
};
