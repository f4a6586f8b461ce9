//! [`KernelConfig`] – everything the coordinator needs to boot.
//!
//! Every section has serde defaults, so an empty TOML document yields the
//! built-in configuration (representative ion-trap parameters and the
//! piezo / e-gun kill-switch limits).
//!
//! ```toml
//! watchdog_timeout = 5.0
//!
//! [network]
//! host = "0.0.0.0"
//! control_port = 5555
//!
//! [kill_switch.piezo]
//! limit_s = 10.0
//! param = "piezo_voltage"
//!
//! [parameters.rf_amp]
//! min = 0.0
//! max = 1.0
//! default = 0.2
//! safe = 0.0
//!
//! [parameters.e_gun]
//! kind = "bool"
//! default = false
//!
//! [fragments]
//! optimizer = true
//! ```

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::Duration;

use ionctl_kernel::{ParamSpec, ParameterStore};
use ionctl_transport::{DEFAULT_DATA_RATE, Endpoints, GatewaySettings};
use ionctl_types::{KernelError, ParamKind};
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Sections
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Start the WebSocket gateway.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// Per-connection data frame limit.
    #[serde(default = "default_max_data_rate")]
    pub max_data_rate: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            control_port: default_control_port(),
            command_port: default_command_port(),
            data_port: default_data_port(),
            max_data_rate: default_max_data_rate(),
        }
    }
}

impl NetworkConfig {
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            host: self.host.clone(),
            control_port: self.control_port,
            command_port: self.command_port,
            data_port: self.data_port,
        }
    }
}

/// Kill-switch entry for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLimit {
    /// Maximum on-time in seconds.
    pub limit_s: f64,
    /// Parameter forced to its safe value when the limit expires.
    #[serde(default)]
    pub param: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentToggles {
    #[serde(default = "default_true")]
    pub kill_switch: bool,
    #[serde(default = "default_true")]
    pub parameters: bool,
    #[serde(default = "default_true")]
    pub experiments: bool,
    #[serde(default = "default_true")]
    pub status: bool,
    #[serde(default)]
    pub optimizer: bool,
}

impl Default for FragmentToggles {
    fn default() -> Self {
        Self {
            kill_switch: true,
            parameters: true,
            experiments: true,
            status: true,
            optimizer: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Age after which finished experiments are evicted from memory.
    #[serde(default = "default_max_age")]
    pub max_age_s: f64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_s: f64,
    /// SQLite file that keeps evicted experiments. Unset: no archive.
    #[serde(default)]
    pub archive_path: Option<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            max_age_s: default_max_age(),
            cleanup_interval_s: default_cleanup_interval(),
            archive_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Parameters the optimizer may move. Empty: every numeric parameter.
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_s: f64,
    #[serde(default = "default_result_timeout")]
    pub result_timeout_s: f64,
    #[serde(default = "default_backoff")]
    pub backoff_s: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            parameters: Vec::new(),
            seed: None,
            request_timeout_s: default_request_timeout(),
            result_timeout_s: default_result_timeout(),
            backoff_s: default_backoff(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// KernelConfig
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    /// Seconds without a heartbeat before a worker counts as lost.
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout: f64,
    /// Seconds a control client waits for the kernel's reply.
    #[serde(default = "default_control_timeout")]
    pub control_timeout: f64,
    /// Poll timeout of the control and data loops, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default = "default_kill_switch")]
    pub kill_switch: BTreeMap<String, DeviceLimit>,
    #[serde(default = "default_parameters")]
    pub parameters: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub fragments: FragmentToggles,
    #[serde(default)]
    pub experiments: ExperimentConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            watchdog_timeout: default_watchdog_timeout(),
            control_timeout: default_control_timeout(),
            poll_interval: default_poll_interval(),
            kill_switch: default_kill_switch(),
            parameters: default_parameters(),
            fragments: FragmentToggles::default(),
            experiments: ExperimentConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, KernelError> {
        let config: KernelConfig =
            toml::from_str(text).map_err(|e| KernelError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent tables before anything is built.
    pub fn validate(&self) -> Result<(), KernelError> {
        positive("watchdog_timeout", self.watchdog_timeout)?;
        positive("control_timeout", self.control_timeout)?;
        positive("poll_interval", self.poll_interval)?;
        positive("experiments.max_age_s", self.experiments.max_age_s)?;
        positive("experiments.cleanup_interval_s", self.experiments.cleanup_interval_s)?;
        if self.network.max_data_rate == 0 {
            return Err(KernelError::Configuration("network.max_data_rate must be > 0".into()));
        }

        for (name, spec) in &self.parameters {
            spec.validate(name)?;
        }

        for (device, limit) in &self.kill_switch {
            positive(&format!("kill_switch.{device}.limit_s"), limit.limit_s)?;
            if let Some(param) = &limit.param {
                if !self.parameters.contains_key(param) {
                    return Err(KernelError::Configuration(format!(
                        "kill switch '{device}' is bound to unknown parameter '{param}'"
                    )));
                }
            }
        }

        if self.fragments.optimizer && !self.fragments.parameters {
            return Err(KernelError::Configuration(
                "the optimizer fragment needs the parameters fragment".into(),
            ));
        }
        for name in &self.optimizer.parameters {
            match self.parameters.get(name) {
                Some(spec) if spec.kind == ParamKind::Number => {}
                Some(_) => {
                    return Err(KernelError::Configuration(format!(
                        "optimizer parameter '{name}' is not numeric"
                    )));
                }
                None => {
                    return Err(KernelError::Configuration(format!(
                        "optimizer parameter '{name}' is not configured"
                    )));
                }
            }
        }
        positive("optimizer.request_timeout_s", self.optimizer.request_timeout_s)?;
        positive("optimizer.result_timeout_s", self.optimizer.result_timeout_s)?;
        positive("optimizer.backoff_s", self.optimizer.backoff_s)?;
        Ok(())
    }

    pub fn parameter_store(&self) -> Result<ParameterStore, KernelError> {
        ParameterStore::new(self.parameters.clone())
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            control_timeout: seconds(self.control_timeout),
            max_data_rate: NonZeroU32::new(self.network.max_data_rate).unwrap_or(DEFAULT_DATA_RATE),
        }
    }

    /// `name -> (min, max)` for the parameters the optimizer may move.
    pub fn optimizer_bounds(&self) -> BTreeMap<String, (f64, f64)> {
        self.parameters
            .iter()
            .filter(|(name, _)| self.optimizer.parameters.is_empty() || self.optimizer.parameters.contains(*name))
            .filter(|(_, spec)| spec.kind == ParamKind::Number)
            .filter_map(|(name, spec)| Some((name.clone(), (spec.min?, spec.max?))))
            .collect()
    }
}

/// Largest accepted duration setting, in seconds (about 31 years).
pub const MAX_SECONDS: f64 = 1.0e9;

/// Seconds to a `Duration`; only called on validated values.
pub fn seconds(s: f64) -> Duration {
    Duration::try_from_secs_f64(s.min(MAX_SECONDS)).unwrap_or(Duration::ZERO)
}

/// At least one nanosecond and at most [`MAX_SECONDS`].
fn positive(name: &str, value: f64) -> Result<(), KernelError> {
    if value.is_finite() && value <= MAX_SECONDS && !seconds(value).is_zero() {
        Ok(())
    } else {
        Err(KernelError::Configuration(format!(
            "{name} must be a positive number of seconds up to {MAX_SECONDS}, got {value}"
        )))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Defaults
// ────────────────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    5555
}

fn default_command_port() -> u16 {
    5556
}

fn default_data_port() -> u16 {
    5557
}

fn default_max_data_rate() -> u32 {
    DEFAULT_DATA_RATE.get()
}

fn default_watchdog_timeout() -> f64 {
    5.0
}

fn default_control_timeout() -> f64 {
    5.0
}

fn default_poll_interval() -> f64 {
    0.1
}

fn default_max_age() -> f64 {
    3600.0
}

fn default_cleanup_interval() -> f64 {
    60.0
}

fn default_request_timeout() -> f64 {
    1.0
}

fn default_result_timeout() -> f64 {
    30.0
}

fn default_backoff() -> f64 {
    0.5
}

fn default_kill_switch() -> BTreeMap<String, DeviceLimit> {
    let mut devices = BTreeMap::new();
    devices.insert(
        "piezo".to_string(),
        DeviceLimit {
            limit_s: 10.0,
            param: Some("piezo_voltage".to_string()),
        },
    );
    devices.insert(
        "e_gun".to_string(),
        DeviceLimit {
            limit_s: 30.0,
            param: Some("e_gun".to_string()),
        },
    );
    devices
}

fn default_parameters() -> BTreeMap<String, ParamSpec> {
    let mut p = BTreeMap::new();
    p.insert("rf_amp".to_string(), ParamSpec::number(0.0, 1.0, 0.2).with_safe(0.0));
    p.insert("rf_freq_mhz".to_string(), ParamSpec::number(10.0, 40.0, 25.0));
    p.insert("dc_endcap_v".to_string(), ParamSpec::number(0.0, 200.0, 20.0));
    p.insert("cooling_detuning_mhz".to_string(), ParamSpec::number(-50.0, 0.0, -10.0));
    p.insert("piezo_voltage".to_string(), ParamSpec::number(0.0, 150.0, 0.0));
    p.insert("oven_current_a".to_string(), ParamSpec::number(0.0, 6.0, 0.0));
    p.insert("e_gun".to_string(), ParamSpec::boolean(false));
    p.insert("pmt_gate".to_string(), ParamSpec::boolean(false));
    p
}
