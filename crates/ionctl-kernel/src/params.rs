//! [`ParameterStore`] – canonical setpoint map with per-name range checks.
//!
//! Every stored value satisfies its [`ParamSpec`] at all times. Writes are
//! validated as a whole before anything is merged, so a rejected request
//! never leaves a partial update behind.

use std::collections::BTreeMap;

use ionctl_types::{KernelError, ParamKind, ParamMap, ParamValue};
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// ParamSpec
// ────────────────────────────────────────────────────────────────────────────

/// Immutable descriptor of one parameter.
///
/// Numeric parameters carry an inclusive `[min, max]` range. Boolean
/// parameters ignore the range. `safe` is the value forced by the
/// safety-defaults path and falls back to `default` when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(default)]
    pub kind: ParamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub default: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe: Option<ParamValue>,
}

impl ParamSpec {
    pub fn number(min: f64, max: f64, default: f64) -> Self {
        Self {
            kind: ParamKind::Number,
            min: Some(min),
            max: Some(max),
            default: ParamValue::Number(default),
            safe: None,
        }
    }

    pub fn boolean(default: bool) -> Self {
        Self {
            kind: ParamKind::Bool,
            min: None,
            max: None,
            default: ParamValue::Bool(default),
            safe: None,
        }
    }

    pub fn with_safe(mut self, safe: impl Into<ParamValue>) -> Self {
        self.safe = Some(safe.into());
        self
    }

    /// Value forced by the safety-defaults path.
    pub fn safe_value(&self) -> ParamValue {
        self.safe.unwrap_or(self.default)
    }

    /// Check `value` against this spec.
    pub fn check(&self, name: &str, value: &ParamValue) -> Result<(), KernelError> {
        if value.kind() != self.kind {
            return Err(KernelError::validation(
                name,
                format!("expected {}, got {}", self.kind, value.kind()),
            ));
        }
        if let ParamValue::Number(v) = *value {
            if !v.is_finite() {
                return Err(KernelError::validation(name, format!("value {v} is not finite")));
            }
            let min = self.min.unwrap_or(f64::NEG_INFINITY);
            let max = self.max.unwrap_or(f64::INFINITY);
            if v < min || v > max {
                return Err(KernelError::validation(
                    name,
                    format!("value {v} outside [{min}, {max}]"),
                ));
            }
        }
        Ok(())
    }

    /// Self-consistency of the descriptor: a numeric range with
    /// `min <= max`, and default/safe values that satisfy it.
    pub fn validate(&self, name: &str) -> Result<(), KernelError> {
        if self.kind == ParamKind::Number {
            let (Some(min), Some(max)) = (self.min, self.max) else {
                return Err(KernelError::Configuration(format!(
                    "parameter '{name}' needs both min and max"
                )));
            };
            if min.is_nan() || max.is_nan() || min > max {
                return Err(KernelError::Configuration(format!(
                    "parameter '{name}' has min {min} > max {max}"
                )));
            }
        }
        self.check(name, &self.default).map_err(|e| {
            KernelError::Configuration(format!("default of '{name}' is invalid: {e}"))
        })?;
        if let Some(safe) = &self.safe {
            self.check(name, safe).map_err(|e| {
                KernelError::Configuration(format!("safe value of '{name}' is invalid: {e}"))
            })?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ParameterStore
// ────────────────────────────────────────────────────────────────────────────

/// Canonical `name -> value` map bound to a fixed table of [`ParamSpec`]s.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use ionctl_kernel::params::{ParamSpec, ParameterStore};
/// use ionctl_types::{ParamMap, ParamValue};
///
/// let mut specs = BTreeMap::new();
/// specs.insert("rf_amp".to_string(), ParamSpec::number(0.0, 1.0, 0.2));
/// let mut store = ParameterStore::new(specs).unwrap();
///
/// let mut write = ParamMap::new();
/// write.insert("rf_amp".into(), ParamValue::Number(0.5));
/// let changed = store.set(&write).unwrap();
/// assert_eq!(changed.len(), 1);
///
/// write.insert("rf_amp".into(), ParamValue::Number(5.0));
/// assert!(store.set(&write).is_err());
/// assert_eq!(store.get("rf_amp"), Some(ParamValue::Number(0.5)));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterStore {
    specs: BTreeMap<String, ParamSpec>,
    values: ParamMap,
}

impl ParameterStore {
    /// Build a store from `specs`, every value starting at its default.
    ///
    /// # Errors
    ///
    /// [`KernelError::Configuration`] when any descriptor is inconsistent.
    pub fn new(specs: BTreeMap<String, ParamSpec>) -> Result<Self, KernelError> {
        for (name, spec) in &specs {
            spec.validate(name)?;
        }
        let values = specs
            .iter()
            .map(|(name, spec)| (name.clone(), spec.default))
            .collect();
        Ok(Self { specs, values })
    }

    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.get(name)
    }

    pub fn specs(&self) -> &BTreeMap<String, ParamSpec> {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.values.get(name).copied()
    }

    pub fn snapshot(&self) -> ParamMap {
        self.values.clone()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Current values of `names`; unknown names are a validation error.
    pub fn select<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<ParamMap, KernelError> {
        names
            .into_iter()
            .map(|name| {
                self.get(name)
                    .map(|v| (name.to_string(), v))
                    .ok_or_else(|| KernelError::validation(name, "unknown parameter"))
            })
            .collect()
    }

    /// Return the first violation in `values`, checked in name order.
    pub fn validate(&self, values: &ParamMap) -> Result<(), KernelError> {
        for (name, value) in values {
            let spec = self
                .specs
                .get(name)
                .ok_or_else(|| KernelError::validation(name, "unknown parameter"))?;
            spec.check(name, value)?;
        }
        Ok(())
    }

    /// Validate then merge `values`. Returns only the entries whose value
    /// actually changed.
    pub fn set(&mut self, values: &ParamMap) -> Result<ParamMap, KernelError> {
        self.validate(values)?;
        let mut changed = ParamMap::new();
        for (name, value) in values {
            if self.values.get(name) != Some(value) {
                self.values.insert(name.clone(), *value);
                changed.insert(name.clone(), *value);
            }
        }
        Ok(changed)
    }

    /// Overwrite every parameter with its safe value. Returns the full map.
    pub fn apply_safe_defaults(&mut self) -> ParamMap {
        for (name, spec) in &self.specs {
            self.values.insert(name.clone(), spec.safe_value());
        }
        self.values.clone()
    }

    /// Force one parameter to its safe value. `None` for unknown names.
    pub fn apply_safe_default(&mut self, name: &str) -> Option<ParamValue> {
        let safe = self.specs.get(name)?.safe_value();
        self.values.insert(name.to_string(), safe);
        Some(safe)
    }
}
