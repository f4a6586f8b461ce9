//! JSON envelopes carried by the control, command and data channels.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::param::{ParamMap, to_json_map};
use crate::{KernelError, Mode, Source};

/// Broadcast topic every worker subscribes to in addition to its own name.
pub const TOPIC_ALL: &str = "ALL";

/// Control-channel action names handled by the kernel and built-in fragments.
pub mod actions {
    pub const SET: &str = "SET";
    pub const GET: &str = "GET";
    pub const STOP: &str = "STOP";
    pub const MODE: &str = "MODE";
    pub const SWEEP: &str = "SWEEP";
    pub const EXPERIMENT_START: &str = "EXPERIMENT_START";
    pub const EXPERIMENT_STATUS: &str = "EXPERIMENT_STATUS";
    pub const STATUS: &str = "STATUS";
    pub const ARM: &str = "ARM";
    pub const DISARM: &str = "DISARM";
}

/// Data-channel categories the kernel knows about.
pub mod categories {
    pub const HEARTBEAT: &str = "HEARTBEAT";
    pub const STATUS: &str = "STATUS";
    pub const ERROR: &str = "ERROR";
    pub const SWEEP_COMPLETE: &str = "SWEEP_COMPLETE";
    pub const TURBO_RESULT: &str = "TURBO_RESULT";
}

// ────────────────────────────────────────────────────────────────────────────
// Control channel
// ────────────────────────────────────────────────────────────────────────────

/// A synchronous control-channel request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: String,
    /// Missing sources are treated as the operator.
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ParamMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
}

impl ControlRequest {
    pub fn new(action: impl Into<String>, source: impl Into<Source>) -> Self {
        Self {
            action: action.into(),
            source: source.into(),
            exp_id: None,
            params: None,
            mode: None,
            command: None,
        }
    }

    pub fn with_params(mut self, params: ParamMap) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_command(mut self, command: Value) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_exp_id(mut self, exp_id: impl Into<String>) -> Self {
        self.exp_id = Some(exp_id.into());
        self
    }

    /// Look up a string field of the `command` payload.
    pub fn command_str(&self, key: &str) -> Option<&str> {
        self.command.as_ref()?.get(key)?.as_str()
    }

    /// The `params` payload, or a `BAD_REQUEST` error naming the action.
    pub fn require_params(&self) -> Result<&ParamMap, KernelError> {
        self.params
            .as_ref()
            .ok_or_else(|| KernelError::BadRequest(format!("{} requires 'params'", self.action)))
    }
}

/// Outcome class of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Rejected,
    Started,
}

/// Reply to a [`ControlRequest`]. Action-specific data is flattened into
/// the top-level JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ControlResponse {
    fn with_status(status: ResponseStatus) -> Self {
        Self {
            status,
            message: None,
            code: None,
            retryable: false,
            data: Map::new(),
        }
    }

    pub fn success() -> Self {
        Self::with_status(ResponseStatus::Success)
    }

    pub fn started() -> Self {
        Self::with_status(ResponseStatus::Started)
    }

    /// Expected denial; `reason` is meant for a human.
    pub fn rejected(reason: impl Into<String>) -> Self {
        let mut r = Self::with_status(ResponseStatus::Rejected);
        r.message = Some(reason.into());
        r
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut r = Self::with_status(ResponseStatus::Error);
        r.code = Some(code.into());
        r.message = Some(message.into());
        r
    }

    /// Map a [`KernelError`] to its wire form. Authorization failures
    /// become `rejected`, everything else `error`.
    pub fn from_error(err: &KernelError) -> Self {
        let mut r = match err {
            KernelError::Authorization(reason) => Self::rejected(reason.clone()),
            other => Self::error(other.code(), other.to_string()),
        };
        r.retryable = err.is_retryable();
        r
    }

    /// Attach an action-specific field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Command channel
// ────────────────────────────────────────────────────────────────────────────

/// Command broadcast to hardware workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub values: Map<String, Value>,
    #[serde(default)]
    pub exp_id: Option<String>,
}

impl CommandEnvelope {
    pub fn new(kind: impl Into<String>, values: Map<String, Value>, exp_id: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            values,
            exp_id,
        }
    }

    /// A `SET` command carrying parameter values.
    pub fn set(params: &ParamMap, exp_id: Option<String>) -> Self {
        Self::new("SET", to_json_map(params), exp_id)
    }
}

/// An envelope tagged with the topic it was broadcast on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub topic: String,
    #[serde(flatten)]
    pub envelope: CommandEnvelope,
}

// ────────────────────────────────────────────────────────────────────────────
// Data channel
// ────────────────────────────────────────────────────────────────────────────

/// Telemetry/result packet sent by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    pub timestamp: f64,
    pub source: String,
    pub category: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub exp_id: Option<String>,
}

impl DataPacket {
    /// Build a packet stamped with the current wall-clock time.
    pub fn new(source: impl Into<String>, category: impl Into<String>, payload: Value) -> Self {
        Self {
            timestamp: Utc::now().timestamp_micros() as f64 / 1e6,
            source: source.into(),
            category: category.into(),
            payload,
            exp_id: None,
        }
    }

    pub fn heartbeat(source: impl Into<String>) -> Self {
        Self::new(source, categories::HEARTBEAT, Value::Null)
    }

    pub fn with_exp_id(mut self, exp_id: impl Into<String>) -> Self {
        self.exp_id = Some(exp_id.into());
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        self.category == categories::HEARTBEAT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParamValue;
    use serde_json::json;

    #[test]
    fn request_defaults_source_to_user() {
        let req: ControlRequest = serde_json::from_str(r#"{"action":"STATUS"}"#).unwrap();
        assert_eq!(req.source, Source::User);
        assert!(req.params.is_none());
    }

    #[test]
    fn request_parses_set_payload() {
        let req: ControlRequest = serde_json::from_str(
            r#"{"action":"SET","source":"TURBO","params":{"rf_amp":0.4},"exp_id":"e1"}"#,
        )
        .unwrap();
        assert_eq!(req.source, Source::Turbo);
        assert_eq!(req.exp_id.as_deref(), Some("e1"));
        assert_eq!(req.require_params().unwrap()["rf_amp"], ParamValue::Number(0.4));
    }

    #[test]
    fn require_params_reports_action() {
        let req = ControlRequest::new("SET", "USER");
        let err = req.require_params().unwrap_err();
        assert!(err.to_string().contains("SET"));
    }

    #[test]
    fn response_flattens_data() {
        let resp = ControlResponse::success().with("mode", "AUTO");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v, json!({"status": "success", "mode": "AUTO"}));
    }

    #[test]
    fn authorization_error_becomes_rejected() {
        let resp = ControlResponse::from_error(&KernelError::Authorization("not in AUTO".into()));
        assert_eq!(resp.status, ResponseStatus::Rejected);
        assert_eq!(resp.message.as_deref(), Some("not in AUTO"));
        assert!(resp.code.is_none());
    }

    #[test]
    fn mode_changed_error_is_retryable_on_the_wire() {
        let resp = ControlResponse::from_error(&KernelError::ModeChanged {
            authorized: crate::Mode::Auto,
            current: crate::Mode::Safe,
        });
        assert_eq!(resp.status, ResponseStatus::Error);
        assert_eq!(resp.code.as_deref(), Some("MODE_CHANGED"));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["retryable"], json!(true));
    }

    #[test]
    fn envelope_uses_type_key_and_null_exp_id() {
        let mut p = ParamMap::new();
        p.insert("rf_amp".into(), ParamValue::Number(0.5));
        let v = serde_json::to_value(CommandEnvelope::set(&p, None)).unwrap();
        assert_eq!(v, json!({"type": "SET", "values": {"rf_amp": 0.5}, "exp_id": null}));
    }

    #[test]
    fn data_packet_tolerates_missing_optional_fields() {
        let p: DataPacket =
            serde_json::from_str(r#"{"timestamp": 1.0, "source": "w1", "category": "HEARTBEAT"}"#)
                .unwrap();
        assert!(p.is_heartbeat());
        assert!(p.exp_id.is_none());
        assert_eq!(p.payload, Value::Null);
    }
}
