//! [`FragmentRegistry`] – ordered collection of hosted fragments.
//!
//! The initialization order is resolved once, at construction:
//!
//! 1. fragments are ranked by [`Priority`] (CRITICAL first), ties keep
//!    registration order;
//! 2. declared dependencies are enforced on top of that ranking (Kahn's
//!    algorithm that always picks the best-ranked ready fragment).
//!
//! Shutdown walks the *achieved* initialization order backwards. Duplicate
//! names, duplicate action claims, missing dependencies and dependency
//! cycles are configuration errors surfaced here, never at request time.

use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use ionctl_types::{KernelError, KernelEvent, Priority, actions};
use tracing::{error, info, warn};

use crate::fragment::Fragment;

/// Actions the router handles itself.
pub const RESERVED_ACTIONS: [&str; 2] = [actions::STOP, actions::MODE];

/// Run a fragment hook, turning a panic into [`KernelError::Fragment`].
pub(crate) fn guarded<T>(fragment: &str, hook: &str, f: impl FnOnce() -> T) -> Result<T, KernelError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let details = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(fragment, hook, %details, "fragment panicked");
        KernelError::Fragment {
            fragment: fragment.to_string(),
            details: format!("{hook} panicked: {details}"),
        }
    })
}

pub struct FragmentRegistry {
    /// Fragments in initialization order.
    fragments: Vec<Arc<dyn Fragment>>,
    by_name: HashMap<String, usize>,
    action_owners: HashMap<String, usize>,
    /// Fragments that own no action; offered unclaimed requests.
    generic: Vec<usize>,
    initialized: Mutex<Vec<usize>>,
}

impl FragmentRegistry {
    /// Resolve the initialization order of `fragments`.
    ///
    /// # Errors
    ///
    /// [`KernelError::Configuration`] for duplicate names, reserved or
    /// doubly-claimed actions, unknown dependencies and cycles.
    pub fn new(fragments: Vec<Arc<dyn Fragment>>) -> Result<Self, KernelError> {
        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, f) in fragments.iter().enumerate() {
            if index.insert(f.name().to_string(), i).is_some() {
                return Err(KernelError::Configuration(format!(
                    "duplicate fragment name '{}'",
                    f.name()
                )));
            }
        }

        // dependents[d] = fragments that wait for d
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); fragments.len()];
        let mut pending: Vec<usize> = vec![0; fragments.len()];
        for (i, f) in fragments.iter().enumerate() {
            for dep in &f.descriptor().dependencies {
                let d = *index.get(dep).ok_or_else(|| {
                    KernelError::Configuration(format!(
                        "fragment '{}' depends on unknown fragment '{dep}'",
                        f.name()
                    ))
                })?;
                dependents[d].push(i);
                pending[i] += 1;
            }
        }

        let rank = |i: usize| -> (Priority, usize) { (fragments[i].descriptor().priority, i) };
        let mut ready: BTreeSet<(Priority, usize)> =
            (0..fragments.len()).filter(|&i| pending[i] == 0).map(rank).collect();
        let mut order = Vec::with_capacity(fragments.len());
        while let Some(next) = ready.pop_first() {
            let i = next.1;
            order.push(i);
            for &j in &dependents[i] {
                pending[j] -= 1;
                if pending[j] == 0 {
                    ready.insert(rank(j));
                }
            }
        }
        if order.len() != fragments.len() {
            let stuck: Vec<&str> = (0..fragments.len())
                .filter(|i| !order.contains(i))
                .map(|i| fragments[i].name())
                .collect();
            return Err(KernelError::Configuration(format!(
                "dependency cycle among fragments: {}",
                stuck.join(", ")
            )));
        }

        let mut slots: Vec<Option<Arc<dyn Fragment>>> = fragments.into_iter().map(Some).collect();
        let fragments: Vec<Arc<dyn Fragment>> =
            order.iter().filter_map(|&i| slots[i].take()).collect();

        let mut by_name = HashMap::new();
        let mut action_owners: HashMap<String, usize> = HashMap::new();
        let mut generic = Vec::new();
        for (pos, f) in fragments.iter().enumerate() {
            by_name.insert(f.name().to_string(), pos);
            if f.actions().is_empty() {
                generic.push(pos);
            }
            for action in f.actions() {
                if RESERVED_ACTIONS.contains(action) {
                    return Err(KernelError::Configuration(format!(
                        "fragment '{}' claims reserved action '{action}'",
                        f.name()
                    )));
                }
                if let Some(&owner) = action_owners.get(*action) {
                    return Err(KernelError::Configuration(format!(
                        "action '{action}' claimed by both '{}' and '{}'",
                        fragments[owner].name(),
                        f.name()
                    )));
                }
                action_owners.insert(action.to_string(), pos);
            }
        }

        Ok(Self {
            fragments,
            by_name,
            action_owners,
            generic,
            initialized: Mutex::new(Vec::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Look up a fragment by name. Callers must handle absence.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Fragment>> {
        self.by_name.get(name).map(|&i| self.fragments[i].clone())
    }

    /// Names in initialization order.
    pub fn names(&self) -> Vec<String> {
        self.fragments.iter().map(|f| f.name().to_string()).collect()
    }

    /// Fragments in initialization order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Fragment>> {
        self.fragments.iter()
    }

    /// Fragments to offer `action` to: its owner, then every generic
    /// fragment in initialization order.
    pub fn candidates(&self, action: &str) -> Vec<&Arc<dyn Fragment>> {
        self.action_owners
            .get(action)
            .into_iter()
            .chain(self.generic.iter())
            .map(|&i| &self.fragments[i])
            .collect()
    }

    /// Fragments that declared `category`, in initialization order.
    pub fn consumers(&self, category: &str) -> Vec<&Arc<dyn Fragment>> {
        self.fragments
            .iter()
            .filter(|f| f.categories().contains(&category))
            .collect()
    }

    /// Names of successfully initialized fragments, in the order achieved.
    pub fn initialized(&self) -> Vec<String> {
        self.lock_initialized()
            .iter()
            .map(|&i| self.fragments[i].name().to_string())
            .collect()
    }

    fn lock_initialized(&self) -> std::sync::MutexGuard<'_, Vec<usize>> {
        self.initialized.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Initialize every fragment in order. On the first failure the
    /// fragments already initialized are shut down again (in reverse) and
    /// the error is returned.
    pub fn initialize_all(&self) -> Result<(), KernelError> {
        for (i, fragment) in self.fragments.iter().enumerate() {
            let name = fragment.name();
            let result = guarded(name, "initialize", || fragment.initialize(self)).and_then(|r| r);
            match result {
                Ok(()) => {
                    info!(fragment = name, priority = ?fragment.descriptor().priority, "fragment initialized");
                    self.lock_initialized().push(i);
                }
                Err(e) => {
                    error!(fragment = name, error = %e, "fragment failed to initialize");
                    self.shutdown_all();
                    return Err(match e {
                        KernelError::Fragment { .. } => e,
                        other => KernelError::Fragment {
                            fragment: name.to_string(),
                            details: other.to_string(),
                        },
                    });
                }
            }
        }
        Ok(())
    }

    /// Shut down every initialized fragment in reverse initialization
    /// order. Failures are logged and do not stop the sequence. Returns the
    /// names in the order they were shut down.
    pub fn shutdown_all(&self) -> Vec<String> {
        let achieved = std::mem::take(&mut *self.lock_initialized());
        let mut order = Vec::with_capacity(achieved.len());
        for &i in achieved.iter().rev() {
            let fragment = &self.fragments[i];
            let name = fragment.name();
            match guarded(name, "shutdown", || fragment.shutdown()).and_then(|r| r) {
                Ok(()) => info!(fragment = name, "fragment shut down"),
                Err(e) => warn!(fragment = name, error = %e, "fragment shutdown failed"),
            }
            order.push(name.to_string());
        }
        order
    }

    /// Hand `event` to every fragment's observer hook, in initialization
    /// order.
    pub fn notify(&self, event: &KernelEvent) {
        for fragment in &self.fragments {
            let _ = guarded(fragment.name(), "on_event", || fragment.on_event(event));
        }
    }
}

impl std::fmt::Debug for FragmentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentRegistry")
            .field("order", &self.names())
            .field("actions", &self.action_owners.keys().collect::<BTreeSet<_>>())
            .finish()
    }
}
