//! `ionctl-types` – shared vocabulary of the coordination kernel.
//!
//! Every crate in the workspace speaks in these types: the operating
//! [`Mode`], the caller [`Source`], typed parameter values, the JSON
//! envelopes carried by the three transport channels, the
//! [`KernelEvent`] observer queue payloads, and the [`KernelError`]
//! taxonomy.

pub mod error;
pub mod event;
pub mod param;
pub mod wire;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use error::KernelError;
pub use event::KernelEvent;
pub use param::{ParamKind, ParamMap, ParamValue};
pub use wire::{
    CommandEnvelope, ControlRequest, ControlResponse, DataPacket, ResponseStatus, TopicMessage,
    actions, categories, TOPIC_ALL,
};

/// Operating state of the whole apparatus.
///
/// `Manual` is the initial state. Entering `Safe` is legal from anywhere;
/// entering `Auto` needs an explicit operator/API `MODE` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    #[default]
    Manual,
    Auto,
    Safe,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Manual => "MANUAL",
            Mode::Auto => "AUTO",
            Mode::Safe => "SAFE",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(Mode::Manual),
            "AUTO" => Ok(Mode::Auto),
            "SAFE" => Ok(Mode::Safe),
            other => Err(KernelError::BadRequest(format!("unknown mode '{other}'"))),
        }
    }
}

/// Caller class of a control request.
///
/// `User` is the human operator; every other source is an automated
/// service (`Turbo` is the optimizer, anything else a named service).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Source {
    #[default]
    User,
    Turbo,
    Service(String),
}

impl Source {
    /// `true` for the human operator.
    pub fn is_operator(&self) -> bool {
        matches!(self, Source::User)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Source::User => "USER",
            Source::Turbo => "TURBO",
            Source::Service(name) => name,
        }
    }
}

impl From<String> for Source {
    fn from(s: String) -> Self {
        match s.as_str() {
            "USER" => Source::User,
            "TURBO" => Source::Turbo,
            _ => Source::Service(s),
        }
    }
}

impl From<&str> for Source {
    fn from(s: &str) -> Self {
        Source::from(s.to_string())
    }
}

impl From<Source> for String {
    fn from(s: Source) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority class of a fragment. Lower variants initialize first and shut
/// down last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    Background,
}
