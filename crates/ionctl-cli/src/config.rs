//! Configuration file – reads/writes `~/.ionctl/config.toml`.
//!
//! `IONCTL_CONFIG` points at an alternative file. After loading, these
//! variables override the file:
//!
//! | Variable | Config field |
//! |---|---|
//! | `IONCTL_BIND_ADDR` | `network.host` |
//! | `IONCTL_CONTROL_PORT` | `network.control_port` |
//! | `IONCTL_COMMAND_PORT` | `network.command_port` |
//! | `IONCTL_DATA_PORT` | `network.data_port` |
//! | `IONCTL_WATCHDOG_TIMEOUT` | `watchdog_timeout` (seconds) |
//!
//! Unparseable override values are ignored with a warning.

use std::fs;
use std::path::{Path, PathBuf};

use ionctl_runtime::KernelConfig;
use tracing::warn;

/// Return the config path: `$IONCTL_CONFIG`, else `~/.ionctl/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("IONCTL_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".ionctl").join("config.toml")
}

/// Load and validate the config. `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<KernelConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    KernelConfig::from_toml(&raw)
        .map(Some)
        .map_err(|e| format!("{} ({})", e, path.display()))
}

/// Apply `IONCTL_*` environment overrides.
pub fn apply_env_overrides(cfg: &mut KernelConfig) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut KernelConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("IONCTL_BIND_ADDR") {
        cfg.network.host = v;
    }
    let port = |key: &str, field: &mut u16| {
        if let Some(v) = lookup(key) {
            match v.trim().parse::<u16>() {
                Ok(p) => *field = p,
                Err(_) => warn!(variable = key, value = %v, "ignoring invalid port override"),
            }
        }
    };
    port("IONCTL_CONTROL_PORT", &mut cfg.network.control_port);
    port("IONCTL_COMMAND_PORT", &mut cfg.network.command_port);
    port("IONCTL_DATA_PORT", &mut cfg.network.data_port);
    if let Some(v) = lookup("IONCTL_WATCHDOG_TIMEOUT") {
        match v.trim().parse::<f64>() {
            Ok(s) if s.is_finite() && s > 0.0 => cfg.watchdog_timeout = s,
            _ => warn!(variable = "IONCTL_WATCHDOG_TIMEOUT", value = %v, "ignoring invalid timeout override"),
        }
    }
}

/// Write `cfg` to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &KernelConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_path_points_to_ionctl_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.to_string_lossy().contains(".ionctl"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn saved_defaults_load_back_unchanged() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let cfg = KernelConfig::default();
        save_to(&cfg, &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "watchdog_timeout = -1.0\n").unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("watchdog_timeout"), "{err}");
    }

    #[test]
    fn overrides_replace_network_and_watchdog() {
        let mut cfg = KernelConfig::default();
        apply_overrides(
            &mut cfg,
            env(&[
                ("IONCTL_BIND_ADDR", "0.0.0.0"),
                ("IONCTL_CONTROL_PORT", "6555"),
                ("IONCTL_DATA_PORT", " 6557 "),
                ("IONCTL_WATCHDOG_TIMEOUT", "2.5"),
            ]),
        );
        assert_eq!(cfg.network.host, "0.0.0.0");
        assert_eq!(cfg.network.control_port, 6555);
        assert_eq!(cfg.network.command_port, 5556);
        assert_eq!(cfg.network.data_port, 6557);
        assert_eq!(cfg.watchdog_timeout, 2.5);
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let mut cfg = KernelConfig::default();
        apply_overrides(
            &mut cfg,
            env(&[
                ("IONCTL_COMMAND_PORT", "not-a-port"),
                ("IONCTL_WATCHDOG_TIMEOUT", "-3"),
            ]),
        );
        assert_eq!(cfg, KernelConfig::default());
    }
}
