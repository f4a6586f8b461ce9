//! [`ModeStateMachine`] – MANUAL / AUTO / SAFE.
//!
//! | From → To | Side effects |
//! |---|---|
//! | any → SAFE | safety defaults applied and broadcast |
//! | AUTO → anything else | [`KernelEvent::AuthorizationLost`] published |
//! | any change | [`KernelEvent::ModeChanged`] published |
//!
//! Every transition is legal; *who* may request which one is decided by
//! the router.

use std::sync::Arc;

use ionctl_types::{KernelEvent, Mode};
use tracing::info;

use crate::events::EventBus;
use crate::safety::{SafetyDefaults, SafetyReport};
use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    pub from: Mode,
    pub to: Mode,
}

impl ModeTransition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

pub struct ModeStateMachine {
    state: Arc<SharedState>,
    events: EventBus,
    safety: Arc<SafetyDefaults>,
}

impl ModeStateMachine {
    pub fn new(state: Arc<SharedState>, events: EventBus, safety: Arc<SafetyDefaults>) -> Self {
        Self { state, events, safety }
    }

    pub fn current(&self) -> Mode {
        self.state.mode()
    }

    /// Move to `target`. Entering SAFE runs the safety-defaults path even
    /// when already in SAFE.
    pub fn transition(&self, target: Mode, reason: &str) -> ModeTransition {
        if target == Mode::Safe {
            let report = self.enter_safe(reason);
            return ModeTransition {
                from: report.previous_mode,
                to: Mode::Safe,
            };
        }
        let from = self.state.with(|core| std::mem::replace(&mut core.mode, target));
        let transition = ModeTransition { from, to: target };
        self.announce(transition, reason);
        transition
    }

    /// Force SAFE and broadcast the safe defaults.
    pub fn enter_safe(&self, reason: &str) -> SafetyReport {
        let report = self.safety.engage(reason);
        self.finish_safe(&report);
        report
    }

    /// Force SAFE only if the mode is still AUTO when the lock is taken.
    pub fn enter_safe_from_auto(&self, reason: &str) -> Option<SafetyReport> {
        let report = self.safety.engage_if(reason, |mode| mode == Mode::Auto)?;
        self.finish_safe(&report);
        Some(report)
    }

    /// Hand control back from AUTO to MANUAL. No-op in any other mode.
    pub fn release_to_manual(&self, reason: &str) -> bool {
        let from = self.state.with(|core| {
            let from = core.mode;
            if from == Mode::Auto {
                core.mode = Mode::Manual;
            }
            from
        });
        if from != Mode::Auto {
            return false;
        }
        self.announce(
            ModeTransition {
                from,
                to: Mode::Manual,
            },
            reason,
        );
        true
    }

    fn finish_safe(&self, report: &SafetyReport) {
        self.announce(
            ModeTransition {
                from: report.previous_mode,
                to: Mode::Safe,
            },
            &report.reason,
        );
        self.safety.publish(report);
    }

    fn announce(&self, transition: ModeTransition, reason: &str) {
        if !transition.changed() {
            return;
        }
        info!(from = %transition.from, to = %transition.to, reason, "mode changed");
        self.events.publish(KernelEvent::ModeChanged {
            from: transition.from,
            to: transition.to,
            reason: reason.to_string(),
        });
        if transition.from == Mode::Auto {
            self.events.publish(KernelEvent::AuthorizationLost { mode: transition.to });
        }
    }
}
