//! [`SafetyDefaults`] – the path every safety trigger funnels through.
//!
//! Two flavours:
//!
//! | Trigger | Effect |
//! |---|---|
//! | STOP, MODE→SAFE, watchdog connection loss | mode forced to SAFE, every parameter set to its safe value, full `SET` broadcast on `ALL` |
//! | kill-switch expiry | the device's parameter set to its safe value, single-entry `SET` broadcast on `ALL` |
//!
//! Both log an audit record (previous values, reason, current experiment)
//! and publish [`KernelEvent::SafetyTriggered`].

use std::sync::Arc;

use ionctl_transport::CommandBus;
use ionctl_types::param::to_json_map;
use ionctl_types::{CommandEnvelope, KernelEvent, Mode, ParamMap, ParamValue, TOPIC_ALL};
use serde_json::Value;
use tracing::warn;

use crate::events::EventBus;
use crate::state::{CoreState, SharedState};

/// What a global safety engagement did.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyReport {
    pub reason: String,
    pub previous_mode: Mode,
    pub previous: ParamMap,
    pub applied: ParamMap,
    pub exp_id: Option<String>,
}

pub struct SafetyDefaults {
    state: Arc<SharedState>,
    bus: CommandBus,
    events: EventBus,
}

impl SafetyDefaults {
    pub fn new(state: Arc<SharedState>, bus: CommandBus, events: EventBus) -> Self {
        Self { state, bus, events }
    }

    fn engage_locked(core: &mut CoreState, reason: &str) -> SafetyReport {
        let previous_mode = core.mode;
        core.mode = Mode::Safe;
        let previous = core.params.snapshot();
        let applied = core.params.apply_safe_defaults();
        SafetyReport {
            reason: reason.to_string(),
            previous_mode,
            previous,
            applied,
            exp_id: core.current_experiment.clone(),
        }
    }

    /// Force SAFE and the safe defaults in one critical section. Does not
    /// broadcast; call [`publish`][Self::publish] afterwards.
    pub fn engage(&self, reason: &str) -> SafetyReport {
        self.state.with(|core| Self::engage_locked(core, reason))
    }

    /// Like [`engage`][Self::engage], but only when `guard` accepts the mode
    /// found under the lock.
    pub fn engage_if(&self, reason: &str, guard: impl FnOnce(Mode) -> bool) -> Option<SafetyReport> {
        self.state.with(|core| {
            if guard(core.mode) {
                Some(Self::engage_locked(core, reason))
            } else {
                None
            }
        })
    }

    /// Broadcast the applied values, write the audit record and notify
    /// observers.
    pub fn publish(&self, report: &SafetyReport) {
        let receivers = self.bus.broadcast(
            TOPIC_ALL,
            CommandEnvelope::set(&report.applied, report.exp_id.clone()),
        );
        let previous = Value::Object(to_json_map(&report.previous));
        let applied = Value::Object(to_json_map(&report.applied));
        warn!(
            reason = %report.reason,
            previous_mode = %report.previous_mode,
            previous = %previous,
            applied = %applied,
            exp_id = ?report.exp_id,
            receivers,
            "safety defaults engaged"
        );
        self.events.publish(KernelEvent::SafetyTriggered {
            reason: report.reason.clone(),
            device: None,
            exp_id: report.exp_id.clone(),
        });
    }

    /// Force the parameter bound to `device` to its safe value and broadcast
    /// it. Devices without a bound parameter only get the audit record and
    /// the event.
    pub fn force_device(&self, device: &str, param: Option<&str>, reason: &str) -> Option<ParamValue> {
        let (previous, applied, exp_id) = self.state.with(|core| {
            let previous = param.and_then(|p| core.params.get(p));
            let applied = param.and_then(|p| core.params.apply_safe_default(p));
            (previous, applied, core.current_experiment.clone())
        });

        if let (Some(name), Some(value)) = (param, applied) {
            let mut values = ParamMap::new();
            values.insert(name.to_string(), value);
            self.bus
                .broadcast(TOPIC_ALL, CommandEnvelope::set(&values, exp_id.clone()));
        }
        warn!(
            device,
            param = ?param,
            previous = ?previous,
            applied = ?applied,
            reason,
            exp_id = ?exp_id,
            "device forced to safe value"
        );
        self.events.publish(KernelEvent::SafetyTriggered {
            reason: reason.to_string(),
            device: Some(device.to_string()),
            exp_id,
        });
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamSpec, ParameterStore};
    use std::collections::BTreeMap;

    fn fixture() -> (Arc<SharedState>, CommandBus, EventBus, SafetyDefaults) {
        let mut specs = BTreeMap::new();
        specs.insert("rf_amp".to_string(), ParamSpec::number(0.0, 1.0, 0.5).with_safe(0.0));
        specs.insert("piezo_voltage".to_string(), ParamSpec::number(0.0, 100.0, 40.0).with_safe(0.0));
        let state = Arc::new(SharedState::new(ParameterStore::new(specs).unwrap()));
        let bus = CommandBus::default();
        let events = EventBus::default();
        let safety = SafetyDefaults::new(state.clone(), bus.clone(), events.clone());
        (state, bus, events, safety)
    }

    #[tokio::test]
    async fn engage_forces_safe_and_broadcasts_everything() {
        let (state, bus, events, safety) = fixture();
        let mut worker = bus.subscribe("dds");
        let mut observer = events.subscribe();
        state.set_current_experiment(Some("exp-1".into()));

        let report = safety.engage("stop");
        safety.publish(&report);

        assert_eq!(state.mode(), Mode::Safe);
        assert_eq!(report.previous_mode, Mode::Manual);
        assert_eq!(report.previous["rf_amp"], ParamValue::Number(0.5));
        let msg = worker.recv().await.unwrap();
        assert_eq!(msg.topic, TOPIC_ALL);
        assert_eq!(msg.envelope.kind, "SET");
        assert_eq!(msg.envelope.values.len(), 2);
        assert_eq!(msg.envelope.values["piezo_voltage"], 0.0);
        assert_eq!(msg.envelope.exp_id.as_deref(), Some("exp-1"));
        assert!(matches!(
            observer.recv().await.unwrap(),
            KernelEvent::SafetyTriggered { device: None, .. }
        ));
    }

    #[test]
    fn engage_if_respects_guard() {
        let (state, _bus, _events, safety) = fixture();
        assert!(safety.engage_if("connection_loss", |m| m == Mode::Auto).is_none());
        assert_eq!(state.mode(), Mode::Manual);
        assert_eq!(state.param("rf_amp"), Some(ParamValue::Number(0.5)));
    }

    #[tokio::test]
    async fn force_device_touches_only_its_parameter() {
        let (state, bus, _events, safety) = fixture();
        let mut worker = bus.subscribe("piezo");
        let applied = safety.force_device("piezo", Some("piezo_voltage"), "kill_switch_timeout");
        assert_eq!(applied, Some(ParamValue::Number(0.0)));
        assert_eq!(state.param("rf_amp"), Some(ParamValue::Number(0.5)));
        assert_eq!(state.mode(), Mode::Manual);
        let msg = worker.recv().await.unwrap();
        assert_eq!(msg.envelope.values.len(), 1);
        assert_eq!(msg.envelope.values["piezo_voltage"], 0.0);
    }

    #[test]
    fn force_device_without_parameter_only_reports() {
        let (_state, bus, events, safety) = fixture();
        let mut worker = bus.subscribe("w");
        let mut observer = events.subscribe();
        assert_eq!(safety.force_device("shutter", None, "kill_switch_timeout"), None);
        assert!(worker.try_recv().is_none());
        assert!(matches!(
            observer.try_recv(),
            Some(KernelEvent::SafetyTriggered { device: Some(_), .. })
        ));
    }
}
