//! Model predictive planner.
//!
//! A planning cycle has three phases with a strict ordering: [`builder`]
//! assembles the global program from the enabled device sub-models,
//! [`solve`] hands it to the mixed-integer-capable CBC backend, and
//! [`interpreter`] turns the primal solution into per-device result
//! series, the posted dispatch schedule and TSDB writes.

pub mod builder;
pub mod interpreter;
pub mod objective;
pub mod solve;

pub use builder::{build, BuiltPlan};
pub use interpreter::publish;
pub use solve::{solve, NumericSeries, PlanOutcome};
