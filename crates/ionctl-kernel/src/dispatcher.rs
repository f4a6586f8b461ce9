//! [`DataDispatcher`] – routes inbound packets by category.
//!
//! | Category | Destination |
//! |---|---|
//! | `HEARTBEAT` | [`WatchdogMonitor::heartbeat`] |
//! | claimed by a fragment | that fragment's `handle_data` (first to accept wins) |
//! | anything else with a known `exp_id` | the experiment's result/error log |
//!
//! Payloads are never interpreted here beyond what the tracker fallback
//! needs. A panicking consumer costs one packet and a log line.

use std::sync::Arc;
use std::time::Duration;

use ionctl_tracker::ExperimentTracker;
use ionctl_transport::DataReceiver;
use ionctl_types::{DataPacket, categories};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::registry::{FragmentRegistry, guarded};
use crate::watchdog::WatchdogMonitor;

/// Where a packet ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Heartbeat,
    Fragment(String),
    Tracker(String),
    Dropped,
}

pub struct DataDispatcher {
    registry: Arc<FragmentRegistry>,
    watchdog: Arc<WatchdogMonitor>,
    tracker: Arc<ExperimentTracker>,
}

impl DataDispatcher {
    pub fn new(
        registry: Arc<FragmentRegistry>,
        watchdog: Arc<WatchdogMonitor>,
        tracker: Arc<ExperimentTracker>,
    ) -> Self {
        Self {
            registry,
            watchdog,
            tracker,
        }
    }

    pub fn dispatch(&self, packet: &DataPacket) -> Dispatch {
        if packet.is_heartbeat() {
            self.watchdog.heartbeat(&packet.source);
            return Dispatch::Heartbeat;
        }

        for fragment in self.registry.consumers(&packet.category) {
            let name = fragment.name();
            match guarded(name, "handle_data", || fragment.handle_data(packet)) {
                Ok(true) => {
                    trace!(category = %packet.category, source = %packet.source, fragment = name, "packet consumed");
                    return Dispatch::Fragment(name.to_string());
                }
                Ok(false) => continue,
                Err(_) => {
                    warn!(category = %packet.category, source = %packet.source, fragment = name, "packet dropped after consumer panic");
                    return Dispatch::Dropped;
                }
            }
        }

        if let Some(exp_id) = packet.exp_id.as_deref() {
            let recorded = self.tracker.update(exp_id, |ctx| {
                if packet.category == categories::ERROR {
                    ctx.add_error(error_message(packet), Some(packet.source.as_str()));
                } else {
                    ctx.add_result(packet.source.clone(), packet.payload.clone());
                }
                Ok(())
            });
            if recorded.is_ok() {
                debug!(category = %packet.category, source = %packet.source, exp_id, "packet recorded on experiment");
                return Dispatch::Tracker(exp_id.to_string());
            }
        }

        debug!(category = %packet.category, source = %packet.source, "unclaimed packet dropped");
        Dispatch::Dropped
    }

    /// Consumer loop over `receiver`, reading with `poll` timeouts so
    /// `shutdown` is noticed promptly. Exits when shutdown flips or every
    /// sender is gone.
    pub async fn run(self: Arc<Self>, mut receiver: DataReceiver, poll: Duration, shutdown: watch::Receiver<bool>) {
        info!("data dispatcher started");
        while !*shutdown.borrow() {
            match receiver.receive_data(poll).await {
                Ok(Some(packet)) => {
                    self.dispatch(&packet);
                }
                Ok(None) => {}
                Err(e) => {
                    info!(reason = %e, "data channel closed");
                    break;
                }
            }
        }
        info!("data dispatcher stopped");
    }
}

fn error_message(packet: &DataPacket) -> String {
    packet
        .payload
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| packet.payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::fragment::{Fragment, FragmentDescriptor};
    use crate::mode::ModeStateMachine;
    use crate::params::ParameterStore;
    use crate::safety::SafetyDefaults;
    use crate::state::SharedState;
    use ionctl_transport::{CommandBus, data_channel};
    use ionctl_types::{ParamMap, Priority};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct Sink {
        descriptor: FragmentDescriptor,
        seen: Mutex<Vec<String>>,
    }

    impl Fragment for Sink {
        fn descriptor(&self) -> &FragmentDescriptor {
            &self.descriptor
        }

        fn categories(&self) -> &[&str] {
            &["SWEEP_COMPLETE", "CRASH"]
        }

        fn handle_data(&self, packet: &DataPacket) -> bool {
            if packet.category == "CRASH" {
                panic!("consumer bug");
            }
            self.seen.lock().unwrap().push(packet.source.clone());
            true
        }
    }

    struct Rig {
        sink: Arc<Sink>,
        tracker: Arc<ExperimentTracker>,
        watchdog: Arc<WatchdogMonitor>,
        dispatcher: Arc<DataDispatcher>,
    }

    fn rig() -> Rig {
        let state = Arc::new(SharedState::new(ParameterStore::new(BTreeMap::new()).unwrap()));
        let events = EventBus::default();
        let safety = Arc::new(SafetyDefaults::new(state.clone(), CommandBus::default(), events.clone()));
        let modes = Arc::new(ModeStateMachine::new(state, events.clone(), safety));
        let watchdog = Arc::new(WatchdogMonitor::new(Duration::from_secs(5), modes, events));
        let tracker = Arc::new(ExperimentTracker::new());
        let sink = Arc::new(Sink {
            descriptor: FragmentDescriptor::new("sink", Priority::Medium),
            seen: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(FragmentRegistry::new(vec![sink.clone() as Arc<dyn Fragment>]).unwrap());
        let dispatcher = Arc::new(DataDispatcher::new(registry, watchdog.clone(), tracker.clone()));
        Rig {
            sink,
            tracker,
            watchdog,
            dispatcher,
        }
    }

    #[test]
    fn heartbeat_goes_to_watchdog() {
        let r = rig();
        assert_eq!(r.dispatcher.dispatch(&DataPacket::heartbeat("dds")), Dispatch::Heartbeat);
        assert_eq!(r.watchdog.is_alive("dds"), Some(true));
    }

    #[test]
    fn claimed_category_goes_to_fragment() {
        let r = rig();
        let packet = DataPacket::new("fpga", "SWEEP_COMPLETE", json!({"counts": [1, 2]}));
        assert_eq!(r.dispatcher.dispatch(&packet), Dispatch::Fragment("sink".into()));
        assert_eq!(*r.sink.seen.lock().unwrap(), vec!["fpga".to_string()]);
    }

    #[test]
    fn unclaimed_packet_with_experiment_goes_to_tracker() {
        let r = rig();
        let id = r.tracker.create(ParamMap::new(), None);
        let status = DataPacket::new("camera", "STATUS", json!({"ions": 3})).with_exp_id(id.clone());
        assert_eq!(r.dispatcher.dispatch(&status), Dispatch::Tracker(id.clone()));
        let error = DataPacket::new("dds", "ERROR", json!({"message": "pll unlocked"})).with_exp_id(id.clone());
        r.dispatcher.dispatch(&error);

        let ctx = r.tracker.get(&id).unwrap();
        assert_eq!(ctx.results()["camera"]["ions"], 3);
        assert_eq!(ctx.errors()[0].message, "pll unlocked");
        assert_eq!(ctx.errors()[0].component.as_deref(), Some("dds"));
    }

    #[test]
    fn unclaimed_packet_without_experiment_is_dropped() {
        let r = rig();
        let packet = DataPacket::new("camera", "STATUS", json!({}));
        assert_eq!(r.dispatcher.dispatch(&packet), Dispatch::Dropped);
        let orphan = packet.with_exp_id("missing");
        assert_eq!(r.dispatcher.dispatch(&orphan), Dispatch::Dropped);
    }

    #[test]
    fn panicking_consumer_drops_packet_only() {
        let r = rig();
        let crash = DataPacket::new("fpga", "CRASH", json!(null));
        assert_eq!(r.dispatcher.dispatch(&crash), Dispatch::Dropped);
        let ok = DataPacket::new("fpga", "SWEEP_COMPLETE", json!(null));
        assert_eq!(r.dispatcher.dispatch(&ok), Dispatch::Fragment("sink".into()));
    }

    #[tokio::test]
    async fn run_loop_drains_channel_until_closed() {
        let r = rig();
        let (tx, rx) = data_channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tx.send(DataPacket::heartbeat("dds"));
        tx.send(DataPacket::new("fpga", "SWEEP_COMPLETE", json!(null)));
        drop(tx);
        r.dispatcher
            .clone()
            .run(rx, Duration::from_millis(10), shutdown_rx)
            .await;
        assert_eq!(r.watchdog.is_alive("dds"), Some(true));
        assert_eq!(r.sink.seen.lock().unwrap().len(), 1);
    }
}
