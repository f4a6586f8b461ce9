//! [`SharedState`] – the coarse-grained lock over mode, parameters and the
//! current-experiment pointer.
//!
//! The control loop, the data loop and the safety loops all read and write
//! these three fields, so they live behind one mutex. Every critical
//! section is short and never awaits.

use std::sync::{Mutex, MutexGuard};

use ionctl_types::{KernelError, Mode, ParamMap, ParamValue};

use crate::params::ParameterStore;

/// Fields guarded by the [`SharedState`] lock.
#[derive(Debug)]
pub struct CoreState {
    pub mode: Mode,
    pub params: ParameterStore,
    pub current_experiment: Option<String>,
}

#[derive(Debug)]
pub struct SharedState {
    core: Mutex<CoreState>,
}

impl SharedState {
    /// Start in [`Mode::Manual`] with no current experiment.
    pub fn new(params: ParameterStore) -> Self {
        Self {
            core: Mutex::new(CoreState {
                mode: Mode::Manual,
                params,
                current_experiment: None,
            }),
        }
    }

    /// Lock the core state. A poisoned lock is recovered: every writer
    /// validates before mutating, so the guarded data is always consistent.
    pub fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    pub fn params(&self) -> ParamMap {
        self.lock().params.snapshot()
    }

    pub fn param(&self, name: &str) -> Option<ParamValue> {
        self.lock().params.get(name)
    }

    pub fn current_experiment(&self) -> Option<String> {
        self.lock().current_experiment.clone()
    }

    pub fn set_current_experiment(&self, exp_id: Option<String>) {
        self.lock().current_experiment = exp_id;
    }

    /// Clear the pointer only if it still names `exp_id`.
    pub fn clear_current_experiment(&self, exp_id: &str) -> bool {
        let mut core = self.lock();
        if core.current_experiment.as_deref() == Some(exp_id) {
            core.current_experiment = None;
            true
        } else {
            false
        }
    }

    /// Run `f` with the lock held.
    pub fn with<T>(&self, f: impl FnOnce(&mut CoreState) -> T) -> T {
        f(&mut self.lock())
    }

    /// Merge `values` into the parameter map, provided the mode is still the
    /// one the request was authorized under.
    ///
    /// The mode check and the write happen under one lock acquisition, so a
    /// concurrent switch to SAFE either lands before (and the write is
    /// refused) or after (and the safety defaults overwrite the write).
    ///
    /// # Errors
    ///
    /// - [`KernelError::ModeChanged`] – the mode moved since authorization;
    ///   nothing was written.
    /// - [`KernelError::Validation`] – see [`ParameterStore::set`].
    pub fn apply_params_if(&self, authorized: Mode, values: &ParamMap) -> Result<ParamMap, KernelError> {
        let mut core = self.lock();
        if core.mode != authorized {
            return Err(KernelError::ModeChanged {
                authorized,
                current: core.mode,
            });
        }
        core.params.set(values)
    }
}
