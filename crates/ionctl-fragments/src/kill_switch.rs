//! [`KillSwitchFragment`] – `ARM` / `DISARM` for time-limited devices.
//!
//! `ARM` starts the device's timer and then applies the request's `params`
//! (the device's "on" values). `DISARM` stops the timer and applies its
//! `params` (the "off" values). Changed values go out as a `SET` on `ALL`.
//! If applying the on-values fails the device is disarmed again, so a
//! refused arm never leaves a timer running.

use std::sync::Arc;

use ionctl_kernel::{Fragment, FragmentDescriptor, FragmentOutcome, KillSwitch, RequestContext, SharedState};
use ionctl_transport::CommandBus;
use ionctl_types::param::to_json_map;
use ionctl_types::{
    CommandEnvelope, ControlRequest, ControlResponse, KernelError, Mode, ParamMap, Priority, TOPIC_ALL, actions,
};
use serde_json::{Value, json};
use tracing::info;

pub const NAME: &str = "kill_switch";

pub struct KillSwitchFragment {
    descriptor: FragmentDescriptor,
    state: Arc<SharedState>,
    bus: CommandBus,
    kill_switch: Arc<KillSwitch>,
}

impl KillSwitchFragment {
    pub fn new(state: Arc<SharedState>, bus: CommandBus, kill_switch: Arc<KillSwitch>) -> Self {
        Self {
            descriptor: FragmentDescriptor::new(NAME, Priority::Critical),
            state,
            bus,
            kill_switch,
        }
    }

    fn device<'r>(request: &'r ControlRequest) -> Result<&'r str, KernelError> {
        request
            .command_str("device")
            .ok_or_else(|| KernelError::BadRequest(format!("{} requires 'command.device'", request.action)))
    }

    /// Apply `request.params` (if any) and broadcast what changed.
    fn apply(&self, request: &ControlRequest, authorized: Mode) -> Result<ParamMap, KernelError> {
        let Some(values) = request.params.as_ref() else {
            return Ok(ParamMap::new());
        };
        let changed = self.state.apply_params_if(authorized, values)?;
        if !changed.is_empty() {
            let exp_id = request
                .exp_id
                .clone()
                .or_else(|| self.state.current_experiment());
            self.bus.broadcast(TOPIC_ALL, CommandEnvelope::set(&changed, exp_id));
        }
        Ok(changed)
    }

    fn arm(&self, ctx: &RequestContext<'_>) -> Result<ControlResponse, KernelError> {
        let request = ctx.request;
        let device = Self::device(request)?;
        let was_armed = self.kill_switch.is_armed(device);
        let metadata = json!({
            "source": request.source.as_str(),
            "exp_id": request.exp_id,
        });
        self.kill_switch.arm(device, metadata)?;

        let changed = match self.apply(request, ctx.authorized_mode) {
            Ok(changed) => changed,
            Err(e) => {
                if !was_armed {
                    self.kill_switch.disarm(device);
                }
                return Err(e);
            }
        };
        let limit_s = self
            .kill_switch
            .limit(device)
            .map(|l| l.as_secs_f64())
            .unwrap_or_default();
        info!(device, source = %request.source, limit_s, "device armed");
        Ok(ControlResponse::success()
            .with("device", device)
            .with("armed", true)
            .with("limit_s", limit_s)
            .with("changed", Value::Object(to_json_map(&changed))))
    }

    fn disarm(&self, ctx: &RequestContext<'_>) -> Result<ControlResponse, KernelError> {
        let request = ctx.request;
        let device = Self::device(request)?;
        if self.kill_switch.limit(device).is_none() {
            return Err(KernelError::UnknownDevice(device.to_string()));
        }
        let was_armed = self.kill_switch.disarm(device);
        let changed = self.apply(request, ctx.authorized_mode)?;
        Ok(ControlResponse::success()
            .with("device", device)
            .with("was_armed", was_armed)
            .with("changed", Value::Object(to_json_map(&changed))))
    }
}

impl Fragment for KillSwitchFragment {
    fn descriptor(&self) -> &FragmentDescriptor {
        &self.descriptor
    }

    fn actions(&self) -> &[&str] {
        &[actions::ARM, actions::DISARM]
    }

    fn handle_request(&self, ctx: &RequestContext<'_>) -> Result<FragmentOutcome, KernelError> {
        let response = match ctx.action() {
            actions::ARM => self.arm(ctx)?,
            actions::DISARM => self.disarm(ctx)?,
            _ => return Ok(FragmentOutcome::NotHandled),
        };
        Ok(FragmentOutcome::Handled(response))
    }
}
