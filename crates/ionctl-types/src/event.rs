//! State-change notifications published on the kernel event queue.
//!
//! Background loops and the router publish these; fragments drain them
//! through their `on_event` hook instead of holding callbacks into each
//! other.

use serde::Serialize;

use crate::Mode;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KernelEvent {
    /// The operating mode changed.
    ModeChanged { from: Mode, to: Mode, reason: String },
    /// Automated services lost their authority (AUTO was left).
    AuthorizationLost { mode: Mode },
    /// A kill switch fired or the safety-defaults path ran.
    SafetyTriggered {
        reason: String,
        device: Option<String>,
        exp_id: Option<String>,
    },
    /// A worker stopped sending heartbeats.
    WorkerLost { worker: String },
    /// A previously lost worker is heartbeating again.
    WorkerRecovered { worker: String },
    /// An experiment reached a terminal status.
    ExperimentFinished { exp_id: String, status: String },
}

impl KernelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            KernelEvent::ModeChanged { .. } => "mode_changed",
            KernelEvent::AuthorizationLost { .. } => "authorization_lost",
            KernelEvent::SafetyTriggered { .. } => "safety_triggered",
            KernelEvent::WorkerLost { .. } => "worker_lost",
            KernelEvent::WorkerRecovered { .. } => "worker_recovered",
            KernelEvent::ExperimentFinished { .. } => "experiment_finished",
        }
    }
}
