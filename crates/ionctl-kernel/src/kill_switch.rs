//! [`KillSwitch`] – per-device maximum "on" time.
//!
//! Arming a device starts its timer. If the device is not disarmed within
//! its configured limit, the enforcement loop triggers it: the entry is
//! removed and the device's safety callback runs exactly once. There is no automatic re-arm; a new arm call starts a new cycle.
//!
//! Entries live behind their own lock, independent of
//! [`SharedState`][crate::state::SharedState]. Callbacks always run after
//! that lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ionctl_types::KernelError;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Invoked with `(device, reason)` when a device is triggered.
pub type SafetyCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Default enforcement poll rate (10 Hz).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reason recorded when the enforcement loop fires.
pub const TIMEOUT_REASON: &str = "kill_switch_timeout";

/// One armed device.
#[derive(Debug, Clone, PartialEq)]
pub struct KillSwitchEntry {
    pub device: String,
    pub armed_at: Instant,
    pub limit: Duration,
    pub metadata: Value,
}

impl KillSwitchEntry {
    pub fn remaining(&self, now: Instant) -> Duration {
        self.limit.saturating_sub(now.saturating_duration_since(self.armed_at))
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.armed_at) > self.limit
    }
}

struct Device {
    limit: Duration,
    callback: Option<SafetyCallback>,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<String, Device>,
    entries: HashMap<String, KillSwitchEntry>,
}

pub struct KillSwitch {
    inner: Mutex<Inner>,
    poll_interval: Duration,
}

impl KillSwitch {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Declare `device` with its maximum on-time. Re-registering replaces
    /// the limit for future arm cycles.
    pub fn register_device(&self, device: impl Into<String>, limit: Duration) {
        let device = device.into();
        let mut inner = self.lock();
        match inner.devices.get_mut(&device) {
            Some(d) => d.limit = limit,
            None => {
                inner.devices.insert(device, Device { limit, callback: None });
            }
        }
    }

    /// Install the callback run when `device` is triggered.
    pub fn set_callback(&self, device: &str, callback: SafetyCallback) -> Result<(), KernelError> {
        let mut inner = self.lock();
        let d = inner
            .devices
            .get_mut(device)
            .ok_or_else(|| KernelError::UnknownDevice(device.to_string()))?;
        d.callback = Some(callback);
        Ok(())
    }

    pub fn devices(&self) -> Vec<(String, Duration)> {
        let mut v: Vec<_> = self
            .lock()
            .devices
            .iter()
            .map(|(name, d)| (name.clone(), d.limit))
            .collect();
        v.sort();
        v
    }

    pub fn limit(&self, device: &str) -> Option<Duration> {
        self.lock().devices.get(device).map(|d| d.limit)
    }

    /// Start the timer for `device`.
    ///
    /// Arming a device that is already armed keeps the original deadline;
    /// the on-time can never be extended without a disarm in between.
    ///
    /// # Errors
    ///
    /// [`KernelError::UnknownDevice`] if `device` was never registered.
    pub fn arm(&self, device: &str, metadata: Value) -> Result<(), KernelError> {
        let mut inner = self.lock();
        let limit = inner
            .devices
            .get(device)
            .map(|d| d.limit)
            .ok_or_else(|| KernelError::UnknownDevice(device.to_string()))?;
        if inner.entries.contains_key(device) {
            debug!(device, "kill switch already armed; deadline unchanged");
            return Ok(());
        }
        inner.entries.insert(
            device.to_string(),
            KillSwitchEntry {
                device: device.to_string(),
                armed_at: Instant::now(),
                limit,
                metadata,
            },
        );
        info!(device, limit_s = limit.as_secs_f64(), "kill switch armed");
        Ok(())
    }

    /// Stop the timer. Returns whether the device was armed; disarming an
    /// idle device is a no-op.
    pub fn disarm(&self, device: &str) -> bool {
        let removed = self.lock().entries.remove(device).is_some();
        if removed {
            info!(device, "kill switch disarmed");
        }
        removed
    }

    pub fn is_armed(&self, device: &str) -> bool {
        self.lock().entries.contains_key(device)
    }

    /// Snapshot of all armed entries, sorted by device.
    pub fn armed(&self) -> Vec<KillSwitchEntry> {
        let mut v: Vec<_> = self.lock().entries.values().cloned().collect();
        v.sort_by(|a, b| a.device.cmp(&b.device));
        v
    }

    /// Kill `device` now. Returns `false` (and does nothing) if the device is
    /// not armed; a second call on the same cycle is therefore a no-op.
    pub fn trigger(&self, device: &str, reason: &str) -> bool {
        let (entry, callback) = {
            let mut inner = self.lock();
            let Some(entry) = inner.entries.remove(device) else {
                return false;
            };
            let callback = inner.devices.get(device).and_then(|d| d.callback.clone());
            (entry, callback)
        };
        warn!(
            device,
            reason,
            on_for_s = entry.armed_at.elapsed().as_secs_f64(),
            limit_s = entry.limit.as_secs_f64(),
            metadata = %entry.metadata,
            "kill switch triggered"
        );
        match callback {
            Some(cb) => cb(device, reason),
            None => warn!(device, "kill switch has no safety callback installed"),
        }
        true
    }

    /// Trigger every entry whose limit has elapsed. Returns the devices
    /// triggered.
    pub fn check_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut expired: Vec<String> = self
            .lock()
            .entries
            .values()
            .filter(|e| e.expired(now))
            .map(|e| e.device.clone())
            .collect();
        expired.sort();
        expired.retain(|device| self.trigger(device, TIMEOUT_REASON));
        expired
    }

    /// Enforcement loop; polls at [`poll_interval`][Self::poll_interval]
    /// until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(poll_ms = self.poll_interval.as_millis() as u64, "kill switch loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_expired();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("kill switch loop stopped");
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(ks: &KillSwitch, device: &str) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        ks.set_callback(device, Arc::new(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        fired
    }

    fn switch() -> KillSwitch {
        let ks = KillSwitch::default();
        ks.register_device("piezo", Duration::from_secs(10));
        ks.register_device("e_gun", Duration::from_secs(30));
        ks
    }

    #[test]
    fn arm_unknown_device_fails() {
        let ks = switch();
        let err = ks.arm("laser", Value::Null).unwrap_err();
        assert_eq!(err, KernelError::UnknownDevice("laser".into()));
        assert!(!ks.is_armed("laser"));
    }

    #[test]
    fn disarm_is_idempotent() {
        let ks = switch();
        ks.arm("piezo", Value::Null).unwrap();
        assert!(ks.disarm("piezo"));
        assert!(!ks.disarm("piezo"));
        assert!(!ks.is_armed("piezo"));
    }

    #[test]
    fn trigger_fires_callback_at_most_once() {
        let ks = switch();
        let fired = counting(&ks, "piezo");
        ks.arm("piezo", Value::Null).unwrap();
        assert!(ks.trigger("piezo", "manual"));
        assert!(!ks.trigger("piezo", "manual"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!ks.is_armed("piezo"));
        assert!(ks.armed().is_empty());
    }

    #[test]
    fn trigger_on_idle_device_is_noop() {
        let ks = switch();
        let fired = counting(&ks, "e_gun");
        assert!(!ks.trigger("e_gun", "manual"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_does_not_extend_deadline() {
        let ks = switch();
        ks.arm("piezo", Value::Null).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        ks.arm("piezo", Value::Null).unwrap();
        tokio::time::advance(Duration::from_millis(4_100)).await;
        assert_eq!(ks.check_expired(), vec!["piezo".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_fires_after_limit_only() {
        let ks = switch();
        let fired = counting(&ks, "piezo");
        ks.arm("piezo", Value::Null).unwrap();

        tokio::time::advance(Duration::from_millis(9_950)).await;
        assert!(ks.check_expired().is_empty());
        assert!(ks.is_armed("piezo"));
        assert_eq!(ks.armed()[0].remaining(Instant::now()), Duration::from_millis(50));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(ks.check_expired(), vec!["piezo".to_string()]);
        assert!(!ks.is_armed("piezo"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(ks.check_expired().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_enforces_limit_within_one_poll() {
        let ks = Arc::new(switch());
        let fired = counting(&ks, "piezo");
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(ks.clone().run(rx));

        ks.arm("piezo", Value::Null).unwrap();
        tokio::time::sleep(Duration::from_millis(9_900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!ks.is_armed("piezo"));

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_before_limit_prevents_callback() {
        let ks = Arc::new(switch());
        let fired = counting(&ks, "e_gun");
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(ks.clone().run(rx));

        ks.arm("e_gun", Value::Null).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(ks.disarm("e_gun"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
