//! [`StatusFragment`] – one-shot snapshot of the whole kernel for `STATUS`.

use std::sync::{Arc, Mutex};

use ionctl_kernel::{
    Fragment, FragmentDescriptor, FragmentOutcome, FragmentRegistry, KillSwitch, RequestContext, SharedState,
    WatchdogMonitor,
};
use ionctl_types::param::to_json_map;
use ionctl_types::{ControlResponse, KernelError, Priority, actions};
use serde_json::{Map, Value, json};
use tokio::time::Instant;

pub const NAME: &str = "status";

pub struct StatusFragment {
    descriptor: FragmentDescriptor,
    state: Arc<SharedState>,
    watchdog: Arc<WatchdogMonitor>,
    kill_switch: Arc<KillSwitch>,
    fragments: Mutex<Vec<String>>,
}

impl StatusFragment {
    pub fn new(state: Arc<SharedState>, watchdog: Arc<WatchdogMonitor>, kill_switch: Arc<KillSwitch>) -> Self {
        Self {
            descriptor: FragmentDescriptor::new(NAME, Priority::Low),
            state,
            watchdog,
            kill_switch,
            fragments: Mutex::new(Vec::new()),
        }
    }

    fn snapshot(&self) -> ControlResponse {
        let (mode, params, exp_id) = self.state.with(|core| {
            (
                core.mode,
                core.params.snapshot(),
                core.current_experiment.clone(),
            )
        });

        let workers: Map<String, Value> = self
            .watchdog
            .liveness()
            .into_iter()
            .map(|(name, alive)| (name, Value::Bool(alive)))
            .collect();

        let now = Instant::now();
        let armed: Vec<Value> = self
            .kill_switch
            .armed()
            .iter()
            .map(|e| {
                json!({
                    "device": e.device,
                    "limit_s": e.limit.as_secs_f64(),
                    "remaining_s": e.remaining(now).as_secs_f64(),
                })
            })
            .collect();

        let fragments = self
            .fragments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        ControlResponse::success()
            .with("mode", mode.as_str())
            .with("params", Value::Object(to_json_map(&params)))
            .with("workers", Value::Object(workers))
            .with("armed", armed)
            .with("exp_id", exp_id)
            .with("fragments", fragments)
    }
}

impl Fragment for StatusFragment {
    fn descriptor(&self) -> &FragmentDescriptor {
        &self.descriptor
    }

    fn actions(&self) -> &[&str] {
        &[actions::STATUS]
    }

    fn initialize(&self, registry: &FragmentRegistry) -> Result<(), KernelError> {
        *self.fragments.lock().unwrap_or_else(|e| e.into_inner()) = registry.names();
        Ok(())
    }

    fn handle_request(&self, ctx: &RequestContext<'_>) -> Result<FragmentOutcome, KernelError> {
        if ctx.action() != actions::STATUS {
            return Ok(FragmentOutcome::NotHandled);
        }
        Ok(FragmentOutcome::Handled(self.snapshot()))
    }
}
