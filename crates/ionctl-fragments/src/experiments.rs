//! [`ExperimentFragment`] – experiment lifecycle and sweep orchestration.
//!
//! | Action / category | Effect |
//! |---|---|
//! | `EXPERIMENT_START` | new running context, becomes current; a running predecessor is aborted |
//! | `EXPERIMENT_STATUS` | summary of `exp_id`, or of the current experiment |
//! | `SWEEP` | broadcast the sweep definition to `command.target` (default `ALL`) |
//! | `SWEEP_COMPLETE` packet | store the payload under the packet source, complete the run |
//! | `ERROR` packet | append to the error log; `payload.fatal = true` fails the run |
//!
//! Experiments are correlated by the packet's `exp_id`, falling back to the
//! current experiment.

use std::sync::Arc;

use ionctl_kernel::{EventBus, Fragment, FragmentDescriptor, FragmentOutcome, RequestContext, SharedState};
use ionctl_tracker::{ExperimentStatus, ExperimentTracker};
use ionctl_transport::CommandBus;
use ionctl_types::{
    CommandEnvelope, ControlRequest, ControlResponse, DataPacket, KernelError, KernelEvent, Priority, TOPIC_ALL,
    actions, categories,
};
use serde_json::Value;
use tracing::{debug, info, warn};

pub const NAME: &str = "experiments";

const SWEEP_PHASE: &str = "sweep";

pub struct ExperimentFragment {
    descriptor: FragmentDescriptor,
    state: Arc<SharedState>,
    bus: CommandBus,
    tracker: Arc<ExperimentTracker>,
    events: EventBus,
}

impl ExperimentFragment {
    pub fn new(state: Arc<SharedState>, bus: CommandBus, tracker: Arc<ExperimentTracker>, events: EventBus) -> Self {
        Self {
            descriptor: FragmentDescriptor::new(NAME, Priority::Medium),
            state,
            bus,
            tracker,
            events,
        }
    }

    // ── Control actions ─────────────────────────────────────────────────────

    fn start(&self, request: &ControlRequest) -> Result<ControlResponse, KernelError> {
        let parent = request.command_str("parent_id");
        if let Some(parent) = parent {
            if !self.tracker.contains(parent) {
                return Err(KernelError::UnknownExperiment(parent.to_string()));
            }
        }
        let exp_id = self.launch(parent)?;
        info!(exp_id = %exp_id, parent = ?parent, source = %request.source, "experiment started");
        let summary = self.tracker.get(&exp_id).map(|c| c.summary());
        Ok(ControlResponse::started()
            .with("exp_id", exp_id)
            .with("experiment", summary))
    }

    fn status(&self, request: &ControlRequest) -> Result<ControlResponse, KernelError> {
        let exp_id = request
            .exp_id
            .clone()
            .or_else(|| self.state.current_experiment())
            .ok_or_else(|| KernelError::BadRequest("no 'exp_id' given and no current experiment".into()))?;
        let ctx = self
            .tracker
            .get(&exp_id)
            .ok_or_else(|| KernelError::UnknownExperiment(exp_id.clone()))?;
        Ok(ControlResponse::success()
            .with("exp_id", exp_id)
            .with("experiment", ctx.summary()))
    }

    fn sweep(&self, request: &ControlRequest) -> Result<ControlResponse, KernelError> {
        let definition = match &request.command {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(KernelError::BadRequest("SWEEP 'command' must be an object".into())),
            None => return Err(KernelError::BadRequest("SWEEP requires 'command'".into())),
        };
        let target = definition
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or(TOPIC_ALL)
            .to_string();

        let exp_id = self.sweep_experiment(request)?;
        self.tracker.update(&exp_id, |ctx| {
            ctx.set_phase(SWEEP_PHASE);
            Ok(())
        })?;

        let receivers = self.bus.broadcast(
            &target,
            CommandEnvelope::new(actions::SWEEP, definition, Some(exp_id.clone())),
        );
        info!(exp_id = %exp_id, target = %target, receivers, "sweep dispatched");
        Ok(ControlResponse::started()
            .with("exp_id", exp_id)
            .with("target", target)
            .with("receivers", receivers))
    }

    /// Experiment a sweep runs under: the requested one, else the current
    /// running one, else a fresh one.
    fn sweep_experiment(&self, request: &ControlRequest) -> Result<String, KernelError> {
        if let Some(id) = &request.exp_id {
            let status = self
                .tracker
                .status(id)
                .ok_or_else(|| KernelError::UnknownExperiment(id.clone()))?;
            if status.is_terminal() {
                return Err(KernelError::BadRequest(format!(
                    "experiment '{id}' is already {}",
                    status.as_str()
                )));
            }
            if status == ExperimentStatus::Created {
                self.tracker.update(id, |ctx| ctx.start())?;
            }
            return Ok(id.clone());
        }
        if let Some(current) = self.state.current_experiment() {
            if self.tracker.status(&current).is_some_and(|s| !s.is_terminal()) {
                return Ok(current);
            }
        }
        self.launch(None)
    }

    /// Create and start a context, make it current and abort whatever
    /// running experiment it replaces.
    fn launch(&self, parent: Option<&str>) -> Result<String, KernelError> {
        let exp_id = self.tracker.create(self.state.params(), parent);
        self.tracker.update(&exp_id, |ctx| ctx.start())?;
        let previous = self
            .state
            .with(|core| core.current_experiment.replace(exp_id.clone()));
        if let Some(previous) = previous {
            let reason = format!("superseded by {exp_id}");
            self.abort(&previous, &reason);
        }
        Ok(exp_id)
    }

    // ── Lifecycle helpers ───────────────────────────────────────────────────

    fn abort(&self, exp_id: &str, reason: &str) {
        let aborted = self.tracker.update(exp_id, |ctx| {
            if ctx.is_terminal() {
                return Ok(false);
            }
            ctx.abort(reason)?;
            Ok(true)
        });
        if let Ok(true) = aborted {
            warn!(exp_id, reason, "experiment aborted");
            self.finished(exp_id, ExperimentStatus::Aborted);
        }
    }

    fn finished(&self, exp_id: &str, status: ExperimentStatus) {
        self.state.clear_current_experiment(exp_id);
        self.events.publish(KernelEvent::ExperimentFinished {
            exp_id: exp_id.to_string(),
            status: status.as_str().to_string(),
        });
    }

    // ── Data packets ────────────────────────────────────────────────────────

    fn sweep_complete(&self, exp_id: &str, packet: &DataPacket) -> bool {
        let outcome = self.tracker.update(exp_id, |ctx| {
            ctx.add_result(packet.source.clone(), packet.payload.clone());
            if ctx.is_terminal() {
                return Ok(false);
            }
            ctx.complete()?;
            Ok(true)
        });
        match outcome {
            Ok(true) => {
                info!(exp_id, source = %packet.source, "experiment completed");
                self.finished(exp_id, ExperimentStatus::Completed);
                true
            }
            Ok(false) => {
                debug!(exp_id, source = %packet.source, "sweep result for a finished experiment stored");
                true
            }
            Err(e) => {
                debug!(exp_id, error = %e, "sweep result not correlated");
                false
            }
        }
    }

    fn record_error(&self, exp_id: &str, packet: &DataPacket) -> bool {
        let message = packet
            .payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| packet.payload.to_string());
        let fatal = packet
            .payload
            .get("fatal")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let outcome = self.tracker.update(exp_id, |ctx| {
            if fatal && !ctx.is_terminal() {
                ctx.fail(message.clone(), Some(packet.source.as_str()))?;
                return Ok(true);
            }
            ctx.add_error(message.clone(), Some(packet.source.as_str()));
            Ok(false)
        });
        match outcome {
            Ok(failed) => {
                warn!(exp_id, source = %packet.source, fatal, message = %message, "worker error recorded");
                if failed {
                    self.finished(exp_id, ExperimentStatus::Failed);
                }
                true
            }
            Err(e) => {
                debug!(exp_id, error = %e, "worker error not correlated");
                false
            }
        }
    }
}

impl Fragment for ExperimentFragment {
    fn descriptor(&self) -> &FragmentDescriptor {
        &self.descriptor
    }

    fn actions(&self) -> &[&str] {
        &[actions::EXPERIMENT_START, actions::EXPERIMENT_STATUS, actions::SWEEP]
    }

    fn categories(&self) -> &[&str] {
        &[categories::SWEEP_COMPLETE, categories::ERROR]
    }

    fn handle_request(&self, ctx: &RequestContext<'_>) -> Result<FragmentOutcome, KernelError> {
        let response = match ctx.action() {
            actions::EXPERIMENT_START => self.start(ctx.request)?,
            actions::EXPERIMENT_STATUS => self.status(ctx.request)?,
            actions::SWEEP => self.sweep(ctx.request)?,
            _ => return Ok(FragmentOutcome::NotHandled),
        };
        Ok(FragmentOutcome::Handled(response))
    }

    fn handle_data(&self, packet: &DataPacket) -> bool {
        let Some(exp_id) = packet
            .exp_id
            .clone()
            .or_else(|| self.state.current_experiment())
        else {
            debug!(category = %packet.category, source = %packet.source, "no experiment to correlate");
            return false;
        };
        match packet.category.as_str() {
            categories::SWEEP_COMPLETE => self.sweep_complete(&exp_id, packet),
            categories::ERROR => self.record_error(&exp_id, packet),
            _ => false,
        }
    }

    fn on_event(&self, event: &KernelEvent) {
        let KernelEvent::SafetyTriggered {
            reason,
            device,
            exp_id: Some(exp_id),
        } = event
        else {
            return;
        };
        match device {
            None => self.abort(exp_id, &format!("safety: {reason}")),
            Some(device) => {
                let noted = self.tracker.update(exp_id, |ctx| {
                    ctx.add_error(format!("kill switch fired: {reason}"), Some(device.as_str()));
                    Ok(())
                });
                if let Err(e) = noted {
                    debug!(exp_id, device = %device, error = %e, "kill switch event not correlated");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ionctl_kernel::{EventReceiver, ParamSpec, ParameterStore};
    use ionctl_types::{Mode, ResponseStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Rig {
        state: Arc<SharedState>,
        bus: CommandBus,
        tracker: Arc<ExperimentTracker>,
        events: EventReceiver,
        fragment: ExperimentFragment,
    }

    fn rig() -> Rig {
        let mut specs = BTreeMap::new();
        specs.insert("detuning_mhz".to_string(), ParamSpec::number(-50.0, 50.0, 0.0));
        let state = Arc::new(SharedState::new(ParameterStore::new(specs).unwrap()));
        let bus = CommandBus::default();
        let tracker = Arc::new(ExperimentTracker::new());
        let bus_events = EventBus::default();
        let events = bus_events.subscribe();
        let fragment = ExperimentFragment::new(state.clone(), bus.clone(), tracker.clone(), bus_events);
        Rig {
            state,
            bus,
            tracker,
            events,
            fragment,
        }
    }

    fn handle(r: &Rig, request: ControlRequest) -> Result<ControlResponse, KernelError> {
        let ctx = RequestContext {
            request: &request,
            authorized_mode: Mode::Manual,
        };
        match r.fragment.handle_request(&ctx)? {
            FragmentOutcome::Handled(resp) => Ok(resp),
            FragmentOutcome::NotHandled => panic!("not handled"),
        }
    }

    fn exp_id(resp: &ControlResponse) -> String {
        resp.data["exp_id"].as_str().unwrap().to_string()
    }

    #[test]
    fn start_creates_running_current_experiment() {
        let r = rig();
        let resp = handle(&r, ControlRequest::new("EXPERIMENT_START", "USER")).unwrap();
        assert_eq!(resp.status, ResponseStatus::Started);
        let id = exp_id(&resp);
        assert_eq!(r.state.current_experiment(), Some(id.clone()));
        assert_eq!(r.tracker.status(&id), Some(ExperimentStatus::Running));
        assert_eq!(resp.data["experiment"]["parameters"], json!({"detuning_mhz": 0.0}));
    }

    #[test]
    fn second_start_aborts_predecessor() {
        let mut r = rig();
        let first = exp_id(&handle(&r, ControlRequest::new("EXPERIMENT_START", "USER")).unwrap());
        let second = exp_id(&handle(&r, ControlRequest::new("EXPERIMENT_START", "USER")).unwrap());
        assert_eq!(r.tracker.status(&first), Some(ExperimentStatus::Aborted));
        assert_eq!(r.state.current_experiment(), Some(second));
        assert!(r.events.drain().iter().any(|e| matches!(
            e,
            KernelEvent::ExperimentFinished { exp_id, status } if *exp_id == first && status == "aborted"
        )));
    }

    #[test]
    fn start_with_unknown_parent_fails() {
        let r = rig();
        let err = handle(
            &r,
            ControlRequest::new("EXPERIMENT_START", "USER").with_command(json!({"parent_id": "ghost"})),
        )
        .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_EXPERIMENT");
    }

    #[test]
    fn status_of_current_or_named_experiment() {
        let r = rig();
        assert_eq!(
            handle(&r, ControlRequest::new("EXPERIMENT_STATUS", "USER")).unwrap_err().code(),
            "BAD_REQUEST"
        );
        let id = exp_id(&handle(&r, ControlRequest::new("EXPERIMENT_START", "USER")).unwrap());
        let resp = handle(&r, ControlRequest::new("EXPERIMENT_STATUS", "USER")).unwrap();
        assert_eq!(resp.data["experiment"]["status"], "running");
        let named = handle(&r, ControlRequest::new("EXPERIMENT_STATUS", "USER").with_exp_id(id)).unwrap();
        assert!(named.is_success());
    }

    #[test]
    fn sweep_creates_experiment_and_broadcasts_definition() {
        let r = rig();
        let mut fpga = r.bus.subscribe("fpga");
        let mut dds = r.bus.subscribe("dds");
        let resp = handle(
            &r,
            ControlRequest::new("SWEEP", "USER").with_command(json!({
                "target": "fpga",
                "param": "detuning_mhz",
                "start": -10.0,
                "stop": 10.0,
                "points": 21
            })),
        )
        .unwrap();
        assert_eq!(resp.status, ResponseStatus::Started);
        let id = exp_id(&resp);
        assert_eq!(r.state.current_experiment(), Some(id.clone()));
        assert_eq!(r.tracker.get(&id).unwrap().phase(), "sweep");

        let msg = fpga.try_recv().unwrap();
        assert_eq!(msg.envelope.kind, "SWEEP");
        assert_eq!(msg.envelope.exp_id, Some(id));
        assert_eq!(msg.envelope.values["points"], 21);
        assert!(dds.try_recv().is_none());
    }

    #[test]
    fn sweep_reuses_running_experiment() {
        let r = rig();
        let id = exp_id(&handle(&r, ControlRequest::new("EXPERIMENT_START", "USER")).unwrap());
        let resp = handle(&r, ControlRequest::new("SWEEP", "USER").with_command(json!({"points": 5}))).unwrap();
        assert_eq!(exp_id(&resp), id);
    }

    #[test]
    fn sweep_validates_command_and_experiment() {
        let r = rig();
        assert_eq!(
            handle(&r, ControlRequest::new("SWEEP", "USER")).unwrap_err().code(),
            "BAD_REQUEST"
        );
        assert_eq!(
            handle(&r, ControlRequest::new("SWEEP", "USER").with_command(json!([1, 2]))).unwrap_err().code(),
            "BAD_REQUEST"
        );
        let unknown = ControlRequest::new("SWEEP", "USER")
            .with_command(json!({}))
            .with_exp_id("ghost");
        assert_eq!(handle(&r, unknown).unwrap_err().code(), "UNKNOWN_EXPERIMENT");
    }

    #[test]
    fn sweep_complete_stores_results_and_finishes() {
        let mut r = rig();
        let id = exp_id(&handle(&r, ControlRequest::new("SWEEP", "USER").with_command(json!({}))).unwrap());
        let packet = DataPacket::new("fpga", "SWEEP_COMPLETE", json!({"counts": [3, 9, 4]})).with_exp_id(id.clone());
        assert!(r.fragment.handle_data(&packet));

        let ctx = r.tracker.get(&id).unwrap();
        assert_eq!(ctx.status(), ExperimentStatus::Completed);
        assert_eq!(ctx.results()["fpga"]["counts"][1], 9);
        assert_eq!(r.state.current_experiment(), None);
        assert!(r.events.drain().iter().any(|e| e.name() == "experiment_finished"));
    }

    #[test]
    fn error_packets_use_current_experiment_and_fatal_fails() {
        let r = rig();
        let id = exp_id(&handle(&r, ControlRequest::new("EXPERIMENT_START", "USER")).unwrap());
        let warning = DataPacket::new("camera", "ERROR", json!({"message": "overexposed"}));
        assert!(r.fragment.handle_data(&warning));
        assert_eq!(r.tracker.status(&id), Some(ExperimentStatus::Running));

        let fatal = DataPacket::new("dds", "ERROR", json!({"message": "pll unlocked", "fatal": true}));
        assert!(r.fragment.handle_data(&fatal));
        let ctx = r.tracker.get(&id).unwrap();
        assert_eq!(ctx.status(), ExperimentStatus::Failed);
        assert_eq!(ctx.errors().len(), 2);
        assert_eq!(ctx.errors()[0].component.as_deref(), Some("camera"));
    }

    #[test]
    fn uncorrelated_packets_are_not_consumed() {
        let r = rig();
        let packet = DataPacket::new("fpga", "SWEEP_COMPLETE", json!({}));
        assert!(!r.fragment.handle_data(&packet));
    }

    #[test]
    fn global_safety_aborts_device_safety_annotates() {
        let r = rig();
        let id = exp_id(&handle(&r, ControlRequest::new("EXPERIMENT_START", "USER")).unwrap());

        r.fragment.on_event(&KernelEvent::SafetyTriggered {
            reason: "kill_switch_timeout".into(),
            device: Some("piezo".into()),
            exp_id: Some(id.clone()),
        });
        let ctx = r.tracker.get(&id).unwrap();
        assert_eq!(ctx.status(), ExperimentStatus::Running);
        assert_eq!(ctx.errors()[0].component.as_deref(), Some("piezo"));

        r.fragment.on_event(&KernelEvent::SafetyTriggered {
            reason: "connection_loss".into(),
            device: None,
            exp_id: Some(id.clone()),
        });
        assert_eq!(r.tracker.status(&id), Some(ExperimentStatus::Aborted));
        assert_eq!(r.state.current_experiment(), None);
    }

    #[test]
    fn device_safety_for_unknown_experiment_is_ignored() {
        let r = rig();
        let id = exp_id(&handle(&r, ControlRequest::new("EXPERIMENT_START", "USER")).unwrap());
        r.fragment.on_event(&KernelEvent::SafetyTriggered {
            reason: "kill_switch_timeout".into(),
            device: Some("piezo".into()),
            exp_id: Some("evicted".into()),
        });
        assert!(r.tracker.get("evicted").is_none());
        assert!(r.tracker.get(&id).unwrap().errors().is_empty());
        assert_eq!(r.state.current_experiment(), Some(id));
    }
}
