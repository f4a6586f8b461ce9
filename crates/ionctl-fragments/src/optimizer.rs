//! [`OptimizerFragment`] – the ask/tell bridge to an automated optimizer.
//!
//! ```text
//!  ┌───────────┐  ask   ┌──────────────┐  SET (source=TURBO)   ┌────────┐
//!  │ Optimizer │ ─────► │  background  │ ────────────────────► │ router │
//!  │ (trait)   │ ◄───── │     loop     │ ◄──── TURBO_RESULT ── │  data  │
//!  └───────────┘  tell  └──────────────┘                       └────────┘
//! ```
//!
//! The loop only works while the kernel is in AUTO. Entering AUTO resets
//! the optimizer; losing authorization parks the loop until the next
//! entry. Candidates go through the control channel like any other
//! automated request, so the router's authority rules apply to them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ionctl_kernel::{Fragment, FragmentDescriptor, FragmentRegistry};
use ionctl_transport::ControlClient;
use ionctl_types::{
    ControlRequest, DataPacket, KernelError, KernelEvent, Mode, ParamMap, ParamValue, Priority, Source, actions,
    categories,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::parameters;

pub const NAME: &str = "optimizer";

/// Result packets buffered between the data loop and the optimizer loop.
const RESULT_QUEUE: usize = 64;

// ────────────────────────────────────────────────────────────────────────────
// Optimizer trait
// ────────────────────────────────────────────────────────────────────────────

/// An ask/tell optimization strategy.
///
/// `ask` proposes the next parameter set to try; `tell` reports the
/// objective measured for it (higher is better).
#[async_trait]
pub trait Optimizer: Send {
    fn name(&self) -> &str;

    async fn ask(&mut self) -> Result<ParamMap, KernelError>;

    async fn tell(&mut self, candidate: &ParamMap, objective: f64) -> Result<(), KernelError>;

    /// Forget all observations.
    fn reset(&mut self);
}

/// Uniform random sampling inside per-parameter bounds. Keeps the best
/// observation seen since the last reset.
pub struct RandomSearch {
    bounds: BTreeMap<String, (f64, f64)>,
    rng: StdRng,
    best: Option<(ParamMap, f64)>,
    observations: u64,
}

impl RandomSearch {
    /// # Errors
    ///
    /// [`KernelError::Configuration`] for empty bounds or a bound whose
    /// `min > max` (or is not finite).
    pub fn new(bounds: BTreeMap<String, (f64, f64)>, seed: Option<u64>) -> Result<Self, KernelError> {
        if bounds.is_empty() {
            return Err(KernelError::Configuration("random search needs at least one parameter".into()));
        }
        for (name, (lo, hi)) in &bounds {
            if !lo.is_finite() || !hi.is_finite() || lo > hi {
                return Err(KernelError::Configuration(format!(
                    "random search bound for '{name}' is invalid: [{lo}, {hi}]"
                )));
            }
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Ok(Self {
            bounds,
            rng,
            best: None,
            observations: 0,
        })
    }

    pub fn best(&self) -> Option<&(ParamMap, f64)> {
        self.best.as_ref()
    }

    pub fn observations(&self) -> u64 {
        self.observations
    }
}

#[async_trait]
impl Optimizer for RandomSearch {
    fn name(&self) -> &str {
        "random_search"
    }

    async fn ask(&mut self) -> Result<ParamMap, KernelError> {
        let rng = &mut self.rng;
        Ok(self
            .bounds
            .iter()
            .map(|(name, &(lo, hi))| {
                let v = if lo == hi { lo } else { rng.random_range(lo..=hi) };
                (name.clone(), ParamValue::Number(v))
            })
            .collect())
    }

    async fn tell(&mut self, candidate: &ParamMap, objective: f64) -> Result<(), KernelError> {
        if !objective.is_finite() {
            return Err(KernelError::validation("objective", "must be finite"));
        }
        self.observations += 1;
        if self.best.as_ref().is_none_or(|(_, best)| objective > *best) {
            self.best = Some((candidate.clone(), objective));
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.best = None;
        self.observations = 0;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Fragment
// ────────────────────────────────────────────────────────────────────────────

/// Timing of the optimizer loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerSettings {
    /// How long to wait for the reply to a candidate `SET`.
    pub request_timeout: Duration,
    /// How long to wait for the `TURBO_RESULT` of a candidate.
    pub result_timeout: Duration,
    /// Pause after a failed iteration.
    pub backoff: Duration,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
            result_timeout: Duration::from_secs(30),
            backoff: Duration::from_millis(500),
        }
    }
}

struct Signals {
    active: watch::Sender<bool>,
    reset: AtomicBool,
    iterations: AtomicU64,
}

pub struct OptimizerFragment {
    descriptor: FragmentDescriptor,
    client: ControlClient,
    settings: OptimizerSettings,
    signals: Arc<Signals>,
    optimizer: Mutex<Option<Box<dyn Optimizer>>>,
    results_tx: mpsc::Sender<DataPacket>,
    results_rx: Mutex<Option<mpsc::Receiver<DataPacket>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OptimizerFragment {
    pub fn new(client: ControlClient, optimizer: Box<dyn Optimizer>, settings: OptimizerSettings) -> Self {
        let (results_tx, results_rx) = mpsc::channel(RESULT_QUEUE);
        let (active, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            descriptor: FragmentDescriptor::new(NAME, Priority::Background).depends_on(parameters::NAME),
            client,
            settings,
            signals: Arc::new(Signals {
                active,
                reset: AtomicBool::new(false),
                iterations: AtomicU64::new(0),
            }),
            optimizer: Mutex::new(Some(optimizer)),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        *self.signals.active.borrow()
    }

    /// Completed ask/SET/result/tell cycles since start.
    pub fn iterations(&self) -> u64 {
        self.signals.iterations.load(Ordering::Relaxed)
    }
}

impl Fragment for OptimizerFragment {
    fn descriptor(&self) -> &FragmentDescriptor {
        &self.descriptor
    }

    fn categories(&self) -> &[&str] {
        &[categories::TURBO_RESULT]
    }

    fn initialize(&self, _registry: &FragmentRegistry) -> Result<(), KernelError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| KernelError::Configuration(format!("optimizer needs a Tokio runtime: {e}")))?;
        let optimizer = self
            .optimizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let results = self
            .results_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let (Some(optimizer), Some(results)) = (optimizer, results) else {
            return Err(KernelError::Configuration("optimizer already initialized".into()));
        };

        info!(strategy = optimizer.name(), "optimizer loop starting");
        let worker = OptimizerLoop {
            client: self.client.clone(),
            settings: self.settings,
            signals: self.signals.clone(),
            optimizer,
            results,
            active: self.signals.active.subscribe(),
            shutdown: self.shutdown.subscribe(),
        };
        let task = handle.spawn(worker.run());
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), KernelError> {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        Ok(())
    }

    fn handle_data(&self, packet: &DataPacket) -> bool {
        if packet.category != categories::TURBO_RESULT {
            return false;
        }
        if self.results_tx.try_send(packet.clone()).is_err() {
            warn!(source = %packet.source, "optimizer result queue full; result dropped");
        }
        true
    }

    fn on_event(&self, event: &KernelEvent) {
        match event {
            KernelEvent::ModeChanged { to: Mode::Auto, .. } => {
                self.signals.reset.store(true, Ordering::SeqCst);
                self.signals.active.send_replace(true);
                info!("optimizer activated");
            }
            KernelEvent::AuthorizationLost { mode } => {
                if self.signals.active.send_replace(false) {
                    info!(mode = %mode, "optimizer parked");
                }
            }
            _ => {}
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Background loop
// ────────────────────────────────────────────────────────────────────────────

struct OptimizerLoop {
    client: ControlClient,
    settings: OptimizerSettings,
    signals: Arc<Signals>,
    optimizer: Box<dyn Optimizer>,
    results: mpsc::Receiver<DataPacket>,
    active: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

/// Why an iteration ended without a `tell`.
enum Interrupt {
    Shutdown,
    Parked,
    Failed,
}

impl OptimizerLoop {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if !*self.active.borrow_and_update() {
                tokio::select! {
                    changed = self.active.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.shutdown.changed() => break,
                }
                continue;
            }
            if self.signals.reset.swap(false, Ordering::SeqCst) {
                self.optimizer.reset();
                while self.results.try_recv().is_ok() {}
                debug!(strategy = self.optimizer.name(), "optimizer reset");
            }
            match self.iterate().await {
                Ok(()) => {
                    self.signals.iterations.fetch_add(1, Ordering::Relaxed);
                }
                Err(Interrupt::Shutdown) => break,
                Err(Interrupt::Parked) => {}
                Err(Interrupt::Failed) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.backoff) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
            }
        }
        info!(iterations = self.signals.iterations.load(Ordering::Relaxed), "optimizer loop stopped");
    }

    async fn iterate(&mut self) -> Result<(), Interrupt> {
        let candidate = self.optimizer.ask().await.map_err(|e| {
            warn!(error = %e, "optimizer ask failed");
            Interrupt::Failed
        })?;

        let request = ControlRequest::new(actions::SET, Source::Turbo).with_params(candidate.clone());
        match self.client.request(request, self.settings.request_timeout).await {
            Ok(response) if response.is_success() => {}
            Ok(response) => {
                debug!(status = ?response.status, message = ?response.message, "candidate refused");
                return Err(Interrupt::Failed);
            }
            Err(e) => {
                warn!(error = %e, "candidate submission failed");
                return Err(Interrupt::Failed);
            }
        }

        let packet = tokio::select! {
            packet = self.results.recv() => packet.ok_or(Interrupt::Shutdown)?,
            _ = tokio::time::sleep(self.settings.result_timeout) => {
                warn!(timeout_s = self.settings.result_timeout.as_secs_f64(), "no optimizer result in time");
                return Err(Interrupt::Failed);
            }
            _ = self.active.changed() => return Err(Interrupt::Parked),
            _ = self.shutdown.changed() => return Err(Interrupt::Shutdown),
        };

        let Some(objective) = packet.payload.get("objective").and_then(|v| v.as_f64()) else {
            warn!(source = %packet.source, "optimizer result without numeric 'objective'");
            return Err(Interrupt::Failed);
        };
        self.optimizer.tell(&candidate, objective).await.map_err(|e| {
            warn!(error = %e, "optimizer tell failed");
            Interrupt::Failed
        })?;
        debug!(objective, source = %packet.source, "optimizer observation recorded");
        Ok(())
    }
}
