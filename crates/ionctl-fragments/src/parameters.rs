//! [`ParameterFragment`] – owner of `SET` and `GET`.

use std::sync::Arc;

use ionctl_kernel::{Fragment, FragmentDescriptor, FragmentOutcome, RequestContext, SharedState};
use ionctl_transport::CommandBus;
use ionctl_types::param::to_json_map;
use ionctl_types::{CommandEnvelope, ControlResponse, KernelError, Priority, TOPIC_ALL, actions};
use serde_json::Value;
use tracing::info;

pub const NAME: &str = "parameters";

pub struct ParameterFragment {
    descriptor: FragmentDescriptor,
    state: Arc<SharedState>,
    bus: CommandBus,
}

impl ParameterFragment {
    pub fn new(state: Arc<SharedState>, bus: CommandBus) -> Self {
        Self {
            descriptor: FragmentDescriptor::new(NAME, Priority::High),
            state,
            bus,
        }
    }

    fn set(&self, ctx: &RequestContext<'_>) -> Result<ControlResponse, KernelError> {
        let request = ctx.request;
        let values = request.require_params()?;
        let changed = self.state.apply_params_if(ctx.authorized_mode, values)?;

        let changed_json = Value::Object(to_json_map(&changed));
        let mut receivers = 0;
        if !changed.is_empty() {
            let exp_id = request
                .exp_id
                .clone()
                .or_else(|| self.state.current_experiment());
            receivers = self.bus.broadcast(TOPIC_ALL, CommandEnvelope::set(&changed, exp_id));
            info!(
                source = %request.source,
                changed = %changed_json,
                receivers,
                "parameters set"
            );
        }
        Ok(ControlResponse::success()
            .with("changed", changed_json)
            .with("params", Value::Object(to_json_map(&self.state.params())))
            .with("receivers", receivers))
    }

    fn get(&self, ctx: &RequestContext<'_>) -> Result<ControlResponse, KernelError> {
        let names = ctx
            .request
            .command
            .as_ref()
            .and_then(|c| c.get("names"))
            .and_then(Value::as_array);
        let params = match names {
            Some(names) => {
                let names: Vec<&str> = names
                    .iter()
                    .map(|n| {
                        n.as_str()
                            .ok_or_else(|| KernelError::BadRequest("GET 'names' must be strings".into()))
                    })
                    .collect::<Result<_, _>>()?;
                self.state.with(|core| core.params.select(names))?
            }
            None => self.state.params(),
        };
        Ok(ControlResponse::success().with("params", Value::Object(to_json_map(&params))))
    }
}

impl Fragment for ParameterFragment {
    fn descriptor(&self) -> &FragmentDescriptor {
        &self.descriptor
    }

    fn actions(&self) -> &[&str] {
        &[actions::SET, actions::GET]
    }

    fn handle_request(&self, ctx: &RequestContext<'_>) -> Result<FragmentOutcome, KernelError> {
        let response = match ctx.action() {
            actions::SET => self.set(ctx)?,
            actions::GET => self.get(ctx)?,
            _ => return Ok(FragmentOutcome::NotHandled),
        };
        Ok(FragmentOutcome::Handled(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ionctl_kernel::{ParamSpec, ParameterStore};
    use ionctl_types::{ControlRequest, Mode, ParamMap, ParamValue, ResponseStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn fixture() -> (Arc<SharedState>, CommandBus, ParameterFragment) {
        let mut specs = BTreeMap::new();
        specs.insert("rf_amp".to_string(), ParamSpec::number(0.0, 1.0, 0.5).with_safe(0.0));
        specs.insert("piezo_v".to_string(), ParamSpec::number(0.0, 150.0, 0.0));
        specs.insert("shutter".to_string(), ParamSpec::boolean(false));
        let state = Arc::new(SharedState::new(ParameterStore::new(specs).unwrap()));
        let bus = CommandBus::default();
        let fragment = ParameterFragment::new(state.clone(), bus.clone());
        (state, bus, fragment)
    }

    fn handle(fragment: &ParameterFragment, request: &ControlRequest, mode: Mode) -> Result<ControlResponse, KernelError> {
        let ctx = RequestContext {
            request,
            authorized_mode: mode,
        };
        match fragment.handle_request(&ctx)? {
            FragmentOutcome::Handled(r) => Ok(r),
            FragmentOutcome::NotHandled => panic!("not handled"),
        }
    }

    #[test]
    fn set_broadcasts_only_changed_values() {
        let (state, bus, fragment) = fixture();
        let mut worker = bus.subscribe("dds");
        let mut params = ParamMap::new();
        params.insert("rf_amp".into(), ParamValue::Number(0.8));
        params.insert("piezo_v".into(), ParamValue::Number(0.0));
        let request = ControlRequest::new("SET", "USER").with_params(params);

        let response = handle(&fragment, &request, Mode::Manual).unwrap();
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.data["changed"], json!({"rf_amp": 0.8}));
        assert_eq!(state.param("rf_amp"), Some(ParamValue::Number(0.8)));

        let msg = worker.try_recv().unwrap();
        assert_eq!(msg.topic, "ALL");
        assert_eq!(msg.envelope.kind, "SET");
        assert_eq!(msg.envelope.values.len(), 1);
    }

    #[test]
    fn invalid_set_leaves_state_and_bus_untouched() {
        let (state, bus, fragment) = fixture();
        let mut worker = bus.subscribe("dds");
        let before = state.params();
        let mut params = ParamMap::new();
        params.insert("rf_amp".into(), ParamValue::Number(0.2));
        params.insert("piezo_v".into(), ParamValue::Number(500.0));
        let request = ControlRequest::new("SET", "USER").with_params(params);

        let err = handle(&fragment, &request, Mode::Manual).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(state.params(), before);
        assert!(worker.try_recv().is_none());
    }

    #[test]
    fn set_refused_when_mode_moved() {
        let (state, _bus, fragment) = fixture();
        state.with(|core| core.mode = Mode::Safe);
        let mut params = ParamMap::new();
        params.insert("rf_amp".into(), ParamValue::Number(0.9));
        let request = ControlRequest::new("SET", "TURBO").with_params(params);

        let err = handle(&fragment, &request, Mode::Auto).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(state.param("rf_amp"), Some(ParamValue::Number(0.5)));
    }

    #[test]
    fn set_without_params_is_bad_request() {
        let (_state, _bus, fragment) = fixture();
        let request = ControlRequest::new("SET", "USER");
        assert_eq!(handle(&fragment, &request, Mode::Manual).unwrap_err().code(), "BAD_REQUEST");
    }

    #[test]
    fn get_returns_whole_map_or_selection() {
        let (_state, _bus, fragment) = fixture();
        let all = handle(&fragment, &ControlRequest::new("GET", "USER"), Mode::Manual).unwrap();
        assert_eq!(all.data["params"].as_object().unwrap().len(), 3);

        let some = ControlRequest::new("GET", "USER").with_command(json!({"names": ["shutter"]}));
        let some = handle(&fragment, &some, Mode::Manual).unwrap();
        assert_eq!(some.data["params"], json!({"shutter": false}));

        let unknown = ControlRequest::new("GET", "USER").with_command(json!({"names": ["nope"]}));
        assert_eq!(
            handle(&fragment, &unknown, Mode::Manual).unwrap_err().code(),
            "VALIDATION_ERROR"
        );
    }
}
