//! `ionctl-kernel` – mode authority, safety and fragment hosting
//!
//! The kernel owns the operating mode, the parameter map and the current
//! experiment pointer, decides who may change them, and forces the
//! apparatus into a safe configuration whenever something goes wrong. It
//! does not talk to hardware itself; fragments and remote workers do.
//!
//! # Modules
//!
//! | Module | Type | Role |
//! |---|---|---|
//! | [`params`] | [`ParameterStore`] | typed, range-checked, all-or-nothing parameter map |
//! | [`state`] | [`SharedState`] | one lock over mode, parameters and current experiment |
//! | [`events`] | [`EventBus`] | in-process observer queue of [`KernelEvent`][ionctl_types::KernelEvent]s |
//! | [`safety`] | [`SafetyDefaults`] | apply safe values, broadcast, audit |
//! | [`mode`] | [`ModeStateMachine`] | MANUAL / AUTO / SAFE transitions |
//! | [`fragment`] | [`Fragment`] | capability contract for hosted modules |
//! | [`registry`] | [`FragmentRegistry`] | dependency-ordered lifecycle and routing tables |
//! | [`router`] | [`RequestRouter`] | control request authorization and dispatch |
//! | [`dispatcher`] | [`DataDispatcher`] | data packet routing by category |
//! | [`kill_switch`] | [`KillSwitch`] | per-device maximum on-time |
//! | [`watchdog`] | [`WatchdogMonitor`] | worker heartbeat liveness |
//!
//! # Safety paths
//!
//! - `STOP`, `MODE→SAFE` and a watchdog connection loss in AUTO all go
//!   through [`ModeStateMachine::enter_safe`]: mode SAFE, every parameter
//!   at its safe value, full `SET` broadcast on `ALL`.
//! - A kill-switch expiry forces only the device's bound parameter via
//!   [`SafetyDefaults::force_device`]; the mode is left alone.

pub mod dispatcher;
pub mod events;
pub mod fragment;
pub mod kill_switch;
pub mod mode;
pub mod params;
pub mod registry;
pub mod router;
pub mod safety;
pub mod state;
pub mod watchdog;

pub use dispatcher::{DataDispatcher, Dispatch};
pub use events::{EventBus, EventReceiver};
pub use fragment::{Fragment, FragmentDescriptor, FragmentOutcome, RequestContext};
pub use kill_switch::{KillSwitch, KillSwitchEntry, SafetyCallback};
pub use mode::{ModeStateMachine, ModeTransition};
pub use params::{ParamSpec, ParameterStore};
pub use registry::FragmentRegistry;
pub use router::RequestRouter;
pub use safety::{SafetyDefaults, SafetyReport};
pub use state::{CoreState, SharedState};
pub use watchdog::{HeartbeatRecord, WatchdogCheck, WatchdogMonitor};
