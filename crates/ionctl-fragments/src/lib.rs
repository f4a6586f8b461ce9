//! `ionctl-fragments` – the fragments every coordinator ships with.
//!
//! | Fragment | Name | Priority | Actions | Data categories |
//! |---|---|---|---|---|
//! | [`KillSwitchFragment`] | `kill_switch` | CRITICAL | `ARM`, `DISARM` | |
//! | [`ParameterFragment`] | `parameters` | HIGH | `SET`, `GET` | |
//! | [`ExperimentFragment`] | `experiments` | MEDIUM | `EXPERIMENT_START`, `EXPERIMENT_STATUS`, `SWEEP` | `SWEEP_COMPLETE`, `ERROR` |
//! | [`StatusFragment`] | `status` | LOW | `STATUS` | |
//! | [`OptimizerFragment`] | `optimizer` | BACKGROUND | | `TURBO_RESULT` |
//!
//! `STOP` and `MODE` are not here; the kernel's router owns them.

pub mod experiments;
pub mod kill_switch;
pub mod optimizer;
pub mod parameters;
pub mod status;

pub use experiments::ExperimentFragment;
pub use kill_switch::KillSwitchFragment;
pub use optimizer::{Optimizer, OptimizerFragment, OptimizerSettings, RandomSearch};
pub use parameters::ParameterFragment;
pub use status::StatusFragment;
