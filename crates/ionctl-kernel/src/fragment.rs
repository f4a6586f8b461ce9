//! The [`Fragment`] capability contract.
//!
//! A fragment is a pluggable unit hosted by the kernel: a hardware adapter,
//! a service bridge, a safety unit or an applet. The registry holds them
//! behind `Arc<dyn Fragment>` and only ever talks to them through this
//! trait.
//!
//! Fragments receive their collaborators (shared state, command bus,
//! tracker, ...) through their constructors. They never reach into each
//! other; cross-fragment lookups go through
//! [`FragmentRegistry::get`][crate::registry::FragmentRegistry::get], which
//! may return `None`.

use std::collections::BTreeSet;

use ionctl_types::{ControlRequest, ControlResponse, DataPacket, KernelError, KernelEvent, Mode, Priority};

use crate::registry::FragmentRegistry;

/// Static identity of a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentDescriptor {
    pub name: String,
    pub priority: Priority,
    pub dependencies: BTreeSet<String>,
}

impl FragmentDescriptor {
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            name: name.into(),
            priority,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }
}

/// Result of offering a request to a fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentOutcome {
    Handled(ControlResponse),
    /// Let the router try the next candidate.
    NotHandled,
}

/// A control request as seen by a fragment.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub request: &'a ControlRequest,
    /// Mode the router authorized the request under. Pass it to
    /// [`SharedState::apply_params_if`][crate::state::SharedState::apply_params_if]
    /// before mutating parameters.
    pub authorized_mode: Mode,
}

impl RequestContext<'_> {
    pub fn action(&self) -> &str {
        &self.request.action
    }
}

/// Capability contract every hosted module implements.
///
/// All hooks take `&self`; fragments keep mutable state behind their own
/// locks. Hooks run on kernel loops and must not block.
pub trait Fragment: Send + Sync {
    fn descriptor(&self) -> &FragmentDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Control actions this fragment owns. Each action may be owned by at
    /// most one fragment. A fragment that owns none is offered every
    /// request nobody else handled.
    fn actions(&self) -> &[&str] {
        &[]
    }

    /// Data categories this fragment consumes.
    fn categories(&self) -> &[&str] {
        &[]
    }

    /// Called once, in initialization order. `registry` can be used to look
    /// up optional collaborators by name.
    fn initialize(&self, _registry: &FragmentRegistry) -> Result<(), KernelError> {
        Ok(())
    }

    /// Called once, in reverse initialization order.
    fn shutdown(&self) -> Result<(), KernelError> {
        Ok(())
    }

    fn handle_request(&self, _ctx: &RequestContext<'_>) -> Result<FragmentOutcome, KernelError> {
        Ok(FragmentOutcome::NotHandled)
    }

    /// Returns `true` when the packet was consumed.
    fn handle_data(&self, _packet: &DataPacket) -> bool {
        false
    }

    /// Observer hook for the kernel event queue.
    fn on_event(&self, _event: &KernelEvent) {}
}
