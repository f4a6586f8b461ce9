//! [`RequestRouter`] – authorization and dispatch of control requests.
//!
//! Per request, in order:
//!
//! 1. `STOP` fast path: force SAFE, no authorization, any source.
//! 2. Authorization:
//!    - operator (`USER`) request while in AUTO → hand back to MANUAL first
//!      (`MODE` requests are exempt, they set the mode explicitly);
//!    - automated source while not in AUTO → `rejected`.
//! 3. `MODE` is handled here: any target from any state.
//! 4. Offer the request to the owning fragment, then to generic fragments.
//! 5. Nobody handled it → `UNKNOWN_ACTION`.
//!
//! Fragment errors and panics are converted to `error` responses; the
//! control loop never sees them.

use std::sync::Arc;

use ionctl_types::param::to_json_map;
use ionctl_types::{ControlRequest, ControlResponse, KernelError, Mode, actions};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::fragment::{FragmentOutcome, RequestContext};
use crate::mode::ModeStateMachine;
use crate::registry::{FragmentRegistry, guarded};

pub const USER_OVERRIDE: &str = "user_override";

pub struct RequestRouter {
    registry: Arc<FragmentRegistry>,
    modes: Arc<ModeStateMachine>,
}

impl RequestRouter {
    pub fn new(registry: Arc<FragmentRegistry>, modes: Arc<ModeStateMachine>) -> Self {
        Self { registry, modes }
    }

    pub fn registry(&self) -> &Arc<FragmentRegistry> {
        &self.registry
    }

    /// Process one request to completion.
    pub fn route(&self, request: &ControlRequest) -> ControlResponse {
        debug!(action = %request.action, source = %request.source, exp_id = ?request.exp_id, "control request");

        if request.action == actions::STOP {
            return self.stop(request);
        }

        let authorized_mode = match self.authorize(request) {
            Ok(mode) => mode,
            Err(e) => {
                info!(action = %request.action, source = %request.source, reason = %e, "request rejected");
                return ControlResponse::from_error(&e);
            }
        };

        if request.action == actions::MODE {
            return match self.set_mode(request) {
                Ok(resp) => resp,
                Err(e) => ControlResponse::from_error(&e),
            };
        }

        let ctx = RequestContext {
            request,
            authorized_mode,
        };
        for fragment in self.registry.candidates(&request.action) {
            let name = fragment.name();
            match guarded(name, "handle_request", || fragment.handle_request(&ctx)).and_then(|r| r) {
                Ok(FragmentOutcome::Handled(response)) => {
                    debug!(action = %request.action, fragment = name, status = ?response.status, "request handled");
                    return response;
                }
                Ok(FragmentOutcome::NotHandled) => continue,
                Err(e) => {
                    if matches!(e, KernelError::ModeChanged { .. }) {
                        warn!(action = %request.action, fragment = name, error = %e, "request aborted by concurrent mode change");
                    } else {
                        warn!(action = %request.action, fragment = name, error = %e, "request failed");
                    }
                    return ControlResponse::from_error(&e);
                }
            }
        }

        ControlResponse::from_error(&KernelError::UnknownAction(request.action.clone()))
    }

    fn stop(&self, request: &ControlRequest) -> ControlResponse {
        let reason = format!("stop requested by {}", request.source);
        let report = self.modes.enter_safe(&reason);
        ControlResponse::success()
            .with("mode", Mode::Safe.as_str())
            .with("previous_mode", report.previous_mode.as_str())
            .with("values", Value::Object(to_json_map(&report.applied)))
    }

    /// Apply the mode-based authority rules. Returns the mode the request is
    /// authorized under.
    fn authorize(&self, request: &ControlRequest) -> Result<Mode, KernelError> {
        let mode = self.modes.current();
        if request.source.is_operator() {
            if mode == Mode::Auto && request.action != actions::MODE {
                self.modes.release_to_manual(USER_OVERRIDE);
                return Ok(self.modes.current());
            }
            return Ok(mode);
        }
        if mode != Mode::Auto {
            return Err(KernelError::Authorization(format!(
                "{} from '{}' refused: automated sources may only act in AUTO (mode is {mode})",
                request.action, request.source
            )));
        }
        Ok(mode)
    }

    fn set_mode(&self, request: &ControlRequest) -> Result<ControlResponse, KernelError> {
        let target = request
            .mode
            .ok_or_else(|| KernelError::BadRequest("MODE requires 'mode'".into()))?;
        let reason = format!("mode request from {}", request.source);
        let transition = self.modes.transition(target, &reason);
        Ok(ControlResponse::success()
            .with("mode", transition.to.as_str())
            .with("previous_mode", transition.from.as_str()))
    }
}
