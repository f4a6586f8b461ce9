//! [`Coordinator`] – wires the kernel, the fragments and the channels
//! together and owns the background loops.
//!
//! | Loop | Cadence | Work |
//! |---|---|---|
//! | control | one request at a time, `poll_interval` read timeout | [`RequestRouter::route`] then reply |
//! | data | `poll_interval` read timeout | [`DataDispatcher::dispatch`] |
//! | watchdog | `watchdog_timeout / 4` | heartbeat liveness, SAFE on loss in AUTO |
//! | kill switch | 10 Hz | per-device on-time enforcement |
//! | events | as published | hand every kernel event to every fragment |
//! | cleanup | `cleanup_interval_s` | evict (and optionally archive) finished experiments |
//!
//! Lifecycle: [`Coordinator::new`] builds everything, [`Coordinator::start`]
//! initializes fragments and spawns the loops, [`Coordinator::serve_gateway`]
//! exposes the channels over the network, and [`Coordinator::shutdown`]
//! issues a final STOP, stops the loops and shuts fragments down in reverse
//! order.

use std::sync::Arc;
use std::time::Duration;

use ionctl_fragments::{
    ExperimentFragment, KillSwitchFragment, OptimizerFragment, OptimizerSettings, ParameterFragment, RandomSearch,
    StatusFragment,
};
use ionctl_kernel::{
    DataDispatcher, EventBus, Fragment, FragmentRegistry, KillSwitch, ModeStateMachine, RequestRouter, SafetyDefaults,
    SharedState, WatchdogMonitor,
};
use ionctl_tracker::{ExperimentArchive, ExperimentTracker};
use ionctl_transport::{
    CommandBus, ControlClient, ControlServer, DataReceiver, DataSender, Gateway, GatewayAddrs, control_channel,
    data_channel,
};
use ionctl_transport::data::DEFAULT_DATA_CAPACITY;
use ionctl_types::{ControlRequest, ControlResponse, KernelError, Source, actions};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::{KernelConfig, seconds};

/// Source tag of requests the coordinator issues itself.
pub const COORDINATOR_SOURCE: &str = "coordinator";

pub struct Coordinator {
    config: KernelConfig,
    state: Arc<SharedState>,
    bus: CommandBus,
    events: EventBus,
    modes: Arc<ModeStateMachine>,
    kill_switch: Arc<KillSwitch>,
    watchdog: Arc<WatchdogMonitor>,
    tracker: Arc<ExperimentTracker>,
    registry: Arc<FragmentRegistry>,
    router: Arc<RequestRouter>,
    dispatcher: Arc<DataDispatcher>,
    client: ControlClient,
    data_sender: DataSender,
    control_server: Option<ControlServer>,
    data_receiver: Option<DataReceiver>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Build the kernel from `config`. Nothing runs until [`start`][Self::start].
    ///
    /// # Errors
    ///
    /// [`KernelError::Configuration`] for an invalid config or fragment set.
    pub fn new(config: KernelConfig) -> Result<Self, KernelError> {
        config.validate()?;

        let state = Arc::new(SharedState::new(config.parameter_store()?));
        let bus = CommandBus::default();
        let events = EventBus::default();
        let safety = Arc::new(SafetyDefaults::new(state.clone(), bus.clone(), events.clone()));
        let modes = Arc::new(ModeStateMachine::new(state.clone(), events.clone(), safety.clone()));
        let watchdog = Arc::new(WatchdogMonitor::new(
            seconds(config.watchdog_timeout),
            modes.clone(),
            events.clone(),
        ));
        let tracker = Arc::new(ExperimentTracker::new());

        let kill_switch = Arc::new(KillSwitch::default());
        for (device, limit) in &config.kill_switch {
            kill_switch.register_device(device.clone(), seconds(limit.limit_s));
            let safety = safety.clone();
            let param = limit.param.clone();
            kill_switch.set_callback(
                device,
                Arc::new(move |device: &str, reason: &str| {
                    safety.force_device(device, param.as_deref(), reason);
                }),
            )?;
        }

        let (client, control_server) = control_channel();
        let (data_sender, data_receiver) = data_channel(DEFAULT_DATA_CAPACITY);

        let toggles = &config.fragments;
        let mut fragments: Vec<Arc<dyn Fragment>> = Vec::new();
        if toggles.kill_switch {
            fragments.push(Arc::new(KillSwitchFragment::new(
                state.clone(),
                bus.clone(),
                kill_switch.clone(),
            )));
        }
        if toggles.parameters {
            fragments.push(Arc::new(ParameterFragment::new(state.clone(), bus.clone())));
        }
        if toggles.experiments {
            fragments.push(Arc::new(ExperimentFragment::new(
                state.clone(),
                bus.clone(),
                tracker.clone(),
                events.clone(),
            )));
        }
        if toggles.status {
            fragments.push(Arc::new(StatusFragment::new(
                state.clone(),
                watchdog.clone(),
                kill_switch.clone(),
            )));
        }
        if toggles.optimizer {
            let strategy = RandomSearch::new(config.optimizer_bounds(), config.optimizer.seed)?;
            let settings = OptimizerSettings {
                request_timeout: seconds(config.optimizer.request_timeout_s),
                result_timeout: seconds(config.optimizer.result_timeout_s),
                backoff: seconds(config.optimizer.backoff_s),
            };
            fragments.push(Arc::new(OptimizerFragment::new(
                client.clone(),
                Box::new(strategy),
                settings,
            )));
        }

        let registry = Arc::new(FragmentRegistry::new(fragments)?);
        let router = Arc::new(RequestRouter::new(registry.clone(), modes.clone()));
        let dispatcher = Arc::new(DataDispatcher::new(
            registry.clone(),
            watchdog.clone(),
            tracker.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            fragments = ?registry.names(),
            parameters = config.parameters.len(),
            devices = config.kill_switch.len(),
            "coordinator built"
        );

        Ok(Self {
            config,
            state,
            bus,
            events,
            modes,
            kill_switch,
            watchdog,
            tracker,
            registry,
            router,
            dispatcher,
            client,
            data_sender,
            control_server: Some(control_server),
            data_receiver: Some(data_receiver),
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Initialize fragments and spawn the background loops.
    ///
    /// # Errors
    ///
    /// [`KernelError::Fragment`] if a fragment fails to initialize (the
    /// ones already initialized are shut down again), or
    /// [`KernelError::Configuration`] when called twice.
    pub fn start(&mut self) -> Result<(), KernelError> {
        let (Some(server), Some(receiver)) = (self.control_server.take(), self.data_receiver.take()) else {
            return Err(KernelError::Configuration("coordinator already started".into()));
        };
        self.registry.initialize_all()?;

        let poll = seconds(self.config.poll_interval);
        let shutdown = self.shutdown_tx.subscribe();

        // Subscribe before anything can publish.
        let events = self.events.subscribe();
        self.tasks.push(tokio::spawn(event_pump(
            events,
            self.registry.clone(),
            shutdown.clone(),
        )));
        self.tasks.push(tokio::spawn(control_loop(
            server,
            self.router.clone(),
            poll,
            shutdown.clone(),
        )));
        self.tasks.push(tokio::spawn(
            self.dispatcher.clone().run(receiver, poll, shutdown.clone()),
        ));
        self.tasks
            .push(tokio::spawn(self.watchdog.clone().run(shutdown.clone())));
        self.tasks
            .push(tokio::spawn(self.kill_switch.clone().run(shutdown.clone())));
        self.tasks.push(tokio::spawn(cleanup_loop(
            self.tracker.clone(),
            self.config.clone(),
            shutdown,
        )));

        info!(mode = %self.modes.current(), "coordinator started");
        Ok(())
    }

    /// Bind the WebSocket gateway and serve it until shutdown.
    ///
    /// # Errors
    ///
    /// [`KernelError::Transport`] when any of the three listeners cannot be
    /// bound. This is the only fatal startup failure.
    pub async fn serve_gateway(&mut self) -> Result<GatewayAddrs, KernelError> {
        let gateway = Gateway::bind(&self.config.network.endpoints()).await?;
        let addrs = gateway.local_addrs()?;
        self.tasks.push(tokio::spawn(gateway.serve(
            self.client.clone(),
            self.bus.clone(),
            self.data_sender.clone(),
            self.config.gateway_settings(),
            self.shutdown_tx.subscribe(),
        )));
        info!(
            control = %addrs.control,
            command = %addrs.command,
            data = %addrs.data,
            "gateway listening"
        );
        Ok(addrs)
    }

    /// Final STOP, stop every loop, then shut fragments down in reverse
    /// initialization order. Returns the shutdown order.
    pub async fn shutdown(mut self) -> Vec<String> {
        let stop = ControlRequest::new(actions::STOP, Source::Service(COORDINATOR_SOURCE.into()));
        let response = self.router.route(&stop);
        info!(status = ?response.status, "final stop issued");

        self.shutdown_tx.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "background loop ended abnormally");
                }
            }
        }
        let order = self.registry.shutdown_all();
        info!(order = ?order, "coordinator stopped");
        order
    }

    /// Process `request` in the caller's task, bypassing the control
    /// channel.
    pub fn route(&self, request: &ControlRequest) -> ControlResponse {
        self.router.route(request)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn bus(&self) -> &CommandBus {
        &self.bus
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn modes(&self) -> &Arc<ModeStateMachine> {
        &self.modes
    }

    pub fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.kill_switch
    }

    pub fn watchdog(&self) -> &Arc<WatchdogMonitor> {
        &self.watchdog
    }

    pub fn tracker(&self) -> &Arc<ExperimentTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<FragmentRegistry> {
        &self.registry
    }

    /// In-process control client; requests go through the control loop.
    pub fn client(&self) -> ControlClient {
        self.client.clone()
    }

    /// In-process data sender; packets go through the data loop.
    pub fn data_sender(&self) -> DataSender {
        self.data_sender.clone()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Loops
// ────────────────────────────────────────────────────────────────────────────

async fn control_loop(
    mut server: ControlServer,
    router: Arc<RequestRouter>,
    poll: Duration,
    shutdown: watch::Receiver<bool>,
) {
    info!("control loop started");
    while !*shutdown.borrow() {
        match server.receive_control(poll).await {
            Ok(Some(pending)) => {
                let response = router.route(&pending.request);
                pending.reply(response);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(reason = %e, "control channel closed");
                break;
            }
        }
    }
    info!("control loop stopped");
}

async fn event_pump(
    mut events: ionctl_kernel::EventReceiver,
    registry: Arc<FragmentRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => registry.notify(&event),
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    // The final STOP publishes right before shutdown.
                    for event in events.drain() {
                        registry.notify(&event);
                    }
                    break;
                }
            }
        }
    }
}

async fn cleanup_loop(tracker: Arc<ExperimentTracker>, config: KernelConfig, mut shutdown: watch::Receiver<bool>) {
    let max_age = seconds(config.experiments.max_age_s);
    let archive = config
        .experiments
        .archive_path
        .as_deref()
        .and_then(|path| match ExperimentArchive::open(path) {
            Ok(archive) => Some(archive),
            Err(e) => {
                warn!(path, error = %e, "experiment archive unavailable; evicted runs are discarded");
                None
            }
        });

    let mut ticker = tokio::time::interval(seconds(config.experiments.cleanup_interval_s));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = tracker.cleanup_old(max_age);
                if evicted.is_empty() {
                    continue;
                }
                match &archive {
                    Some(archive) => match archive.archive_terminal(evicted.iter()) {
                        Ok(stored) => info!(evicted = evicted.len(), stored, "finished experiments archived"),
                        Err(e) => warn!(evicted = evicted.len(), error = %e, "archiving evicted experiments failed"),
                    },
                    None => info!(evicted = evicted.len(), "finished experiments evicted"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
