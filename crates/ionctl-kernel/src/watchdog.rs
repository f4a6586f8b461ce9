//! [`WatchdogMonitor`] – worker liveness.
//!
//! Every heartbeat-category packet refreshes the sending worker's
//! `last_seen`. A poll loop marks a worker lost once it has been silent for
//! longer than the timeout, and, if the kernel is in AUTO at that moment,
//! forces SAFE with reason `"connection_loss"`.
//!
//! Firing is once per outage: the worker stays lost (and `last_seen` is
//! reset) until a new heartbeat arrives. Workers that never sent a
//! heartbeat are not tracked.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ionctl_types::KernelEvent;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::events::EventBus;
use crate::mode::ModeStateMachine;

pub const CONNECTION_LOSS: &str = "connection_loss";

/// Per-worker heartbeat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub last_seen: Instant,
    pub alive: bool,
}

/// Outcome of one watchdog poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogCheck {
    pub lost: Vec<String>,
    pub forced_safe: bool,
}

pub struct WatchdogMonitor {
    timeout: Duration,
    poll_interval: Duration,
    workers: Mutex<HashMap<String, HeartbeatRecord>>,
    modes: Arc<ModeStateMachine>,
    events: EventBus,
}

impl WatchdogMonitor {
    pub fn new(timeout: Duration, modes: Arc<ModeStateMachine>, events: EventBus) -> Self {
        // Poll a few times per timeout window, bounded to [50 ms, 1 s].
        let poll_interval = (timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(1));
        Self {
            timeout,
            poll_interval,
            workers: Mutex::new(HashMap::new()),
            modes,
            events,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HeartbeatRecord>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a heartbeat from `worker`.
    pub fn heartbeat(&self, worker: &str) {
        let recovered = {
            let mut workers = self.lock();
            let now = Instant::now();
            match workers.get_mut(worker) {
                Some(record) => {
                    record.last_seen = now;
                    !std::mem::replace(&mut record.alive, true)
                }
                None => {
                    workers.insert(
                        worker.to_string(),
                        HeartbeatRecord {
                            last_seen: now,
                            alive: true,
                        },
                    );
                    info!(worker, "worker registered by first heartbeat");
                    false
                }
            }
        };
        if recovered {
            info!(worker, "worker heartbeat recovered");
            self.events.publish(KernelEvent::WorkerRecovered {
                worker: worker.to_string(),
            });
        }
    }

    pub fn is_alive(&self, worker: &str) -> Option<bool> {
        self.lock().get(worker).map(|r| r.alive)
    }

    /// `worker -> alive` for every tracked worker.
    pub fn liveness(&self) -> BTreeMap<String, bool> {
        self.lock()
            .iter()
            .map(|(name, r)| (name.clone(), r.alive))
            .collect()
    }

    /// One poll: mark silent workers lost and, in AUTO, force SAFE once.
    pub fn check(&self) -> WatchdogCheck {
        let now = Instant::now();
        let mut lost: Vec<String> = {
            let mut workers = self.lock();
            workers
                .iter_mut()
                .filter(|(_, r)| r.alive && now.saturating_duration_since(r.last_seen) > self.timeout)
                .map(|(name, r)| {
                    r.alive = false;
                    r.last_seen = now;
                    name.clone()
                })
                .collect()
        };
        if lost.is_empty() {
            return WatchdogCheck::default();
        }
        lost.sort();

        for worker in &lost {
            warn!(worker = %worker, timeout_s = self.timeout.as_secs_f64(), "worker heartbeat lost");
            self.events.publish(KernelEvent::WorkerLost {
                worker: worker.clone(),
            });
        }
        let forced_safe = match self.modes.enter_safe_from_auto(CONNECTION_LOSS) {
            Some(report) => {
                error!(
                    workers = ?lost,
                    exp_id = ?report.exp_id,
                    "connection loss in AUTO; forced SAFE"
                );
                true
            }
            None => false,
        };
        WatchdogCheck { lost, forced_safe }
    }

    /// Poll loop; exits when `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            timeout_s = self.timeout.as_secs_f64(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "watchdog loop started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("watchdog loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamSpec, ParameterStore};
    use crate::safety::SafetyDefaults;
    use crate::state::SharedState;
    use ionctl_transport::CommandBus;
    use ionctl_types::Mode;
    use std::collections::BTreeMap;

    struct Rig {
        state: Arc<SharedState>,
        modes: Arc<ModeStateMachine>,
        events: EventBus,
        watchdog: Arc<WatchdogMonitor>,
    }

    fn rig() -> Rig {
        let mut specs = BTreeMap::new();
        specs.insert("rf_amp".to_string(), ParamSpec::number(0.0, 1.0, 0.5).with_safe(0.0));
        let state = Arc::new(SharedState::new(ParameterStore::new(specs).unwrap()));
        let events = EventBus::default();
        let safety = Arc::new(SafetyDefaults::new(state.clone(), CommandBus::default(), events.clone()));
        let modes = Arc::new(ModeStateMachine::new(state.clone(), events.clone(), safety));
        let watchdog = Arc::new(WatchdogMonitor::new(
            Duration::from_secs(5),
            modes.clone(),
            events.clone(),
        ));
        Rig { state, modes, events, watchdog }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_worker_in_auto_forces_safe_once() {
        let r = rig();
        r.modes.transition(Mode::Auto, "operator");
        r.watchdog.heartbeat("dds");

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(r.watchdog.check(), WatchdogCheck::default());

        tokio::time::advance(Duration::from_millis(1_100)).await;
        let check = r.watchdog.check();
        assert_eq!(check.lost, vec!["dds".to_string()]);
        assert!(check.forced_safe);
        assert_eq!(r.state.mode(), Mode::Safe);

        // Still down: no repeat.
        r.modes.transition(Mode::Auto, "operator");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(r.watchdog.check(), WatchdogCheck::default());
        assert_eq!(r.state.mode(), Mode::Auto);
    }

    #[tokio::test(start_paused = true)]
    async fn new_heartbeat_rearms_outage_detection() {
        let r = rig();
        let mut rx = r.events.subscribe();
        r.modes.transition(Mode::Auto, "operator");
        r.watchdog.heartbeat("dds");
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(r.watchdog.check().forced_safe);
        assert_eq!(r.watchdog.is_alive("dds"), Some(false));

        r.watchdog.heartbeat("dds");
        assert_eq!(r.watchdog.is_alive("dds"), Some(true));
        r.modes.transition(Mode::Auto, "operator");
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(r.watchdog.check().forced_safe);

        let names: Vec<_> = rx.drain().iter().map(KernelEvent::name).collect();
        assert!(names.contains(&"worker_lost"));
        assert!(names.contains(&"worker_recovered"));
    }

    #[tokio::test(start_paused = true)]
    async fn outage_outside_auto_only_marks_worker() {
        let r = rig();
        r.watchdog.heartbeat("camera");
        tokio::time::advance(Duration::from_secs(6)).await;
        let check = r.watchdog.check();
        assert_eq!(check.lost.len(), 1);
        assert!(!check.forced_safe);
        assert_eq!(r.state.mode(), Mode::Manual);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_workers_are_not_tracked() {
        let r = rig();
        r.modes.transition(Mode::Auto, "operator");
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(r.watchdog.check(), WatchdogCheck::default());
        assert!(r.watchdog.liveness().is_empty());
        assert_eq!(r.watchdog.is_alive("ghost"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_detects_outage() {
        let r = rig();
        r.modes.transition(Mode::Auto, "operator");
        r.watchdog.heartbeat("dds");
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(r.watchdog.clone().run(rx));
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(r.state.mode(), Mode::Safe);
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
