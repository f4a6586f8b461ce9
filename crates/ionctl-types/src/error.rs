use thiserror::Error;

use crate::Mode;

/// Error taxonomy of the coordination kernel.
///
/// Validation and authorization failures are expected outcomes handled by
/// the router; they never take the process down.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("invalid parameter '{name}': {reason}")]
    Validation { name: String, reason: String },

    #[error("{0}")]
    Authorization(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("timed out after {timeout_ms} ms waiting on the {channel} channel")]
    TransportTimeout { channel: String, timeout_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("mode changed from {authorized} to {current} before the request was applied")]
    ModeChanged { authorized: Mode, current: Mode },

    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    #[error("unknown experiment '{0}'")]
    UnknownExperiment(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("fragment '{fragment}' failed: {details}")]
    Fragment { fragment: String, details: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl KernelError {
    /// Stable machine-readable code used in `error` responses.
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::Validation { .. } => "VALIDATION_ERROR",
            KernelError::Authorization(_) => "AUTHORIZATION_DENIED",
            KernelError::UnknownAction(_) => "UNKNOWN_ACTION",
            KernelError::TransportTimeout { .. } => "TRANSPORT_TIMEOUT",
            KernelError::Transport(_) => "TRANSPORT_ERROR",
            KernelError::ModeChanged { .. } => "MODE_CHANGED",
            KernelError::UnknownDevice(_) => "UNKNOWN_DEVICE",
            KernelError::UnknownExperiment(_) => "UNKNOWN_EXPERIMENT",
            KernelError::InvalidTransition { .. } => "INVALID_TRANSITION",
            KernelError::BadRequest(_) => "BAD_REQUEST",
            KernelError::Fragment { .. } => "FRAGMENT_ERROR",
            KernelError::Configuration(_) => "CONFIGURATION_ERROR",
            KernelError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether the caller may simply re-issue the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KernelError::ModeChanged { .. } | KernelError::TransportTimeout { .. }
        )
    }

    pub fn validation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        KernelError::Validation {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        KernelError::Serialization(e.to_string())
    }
}
