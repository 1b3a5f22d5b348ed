//! Rolling per-holder limits
//!
//! Counters are grouped in domains, each tracked over daily, weekly and
//! monthly windows. Hard ceilings reject a transfer; check and risk
//! thresholds only flag it.

pub mod engine;
pub mod types;

pub use engine::{LimitOutcome, LimitsEngine};
pub use types::{AppliedLimit, LimitDomain, LimitSpec, LimitStats, Window, persisted_only};
