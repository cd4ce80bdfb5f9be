//! Companion-server supervisor: start/stop/restart state machine plus the
//! liveness and health monitors.
//!
//! All mutable state lives on one tokio task (the control sequence), driven
//! by a message channel and two optional monitor intervals. Blocking work —
//! lock acquisition, spawn, kill and reap — runs on `spawn_blocking`
//! workers whose results come back as messages; nothing off the control
//! sequence ever touches supervisor state.

use std::{path::PathBuf, process::Child, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Interval, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::{
    control::{ControlClient, InitPayload},
    launcher::{self, LaunchRequest},
    listener::{DebugListener, DebugSocketFactory, LoopbackSocketFactory},
    lock::SingletonLock,
    paths,
    ports::{self, PortSet},
    settings::{self, ServerSettings},
};

/// OS-level liveness poll cadence.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// HTTP health poll cadence.
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Startup overrides handed in by the embedding host. Precedence is
/// override > persisted setting > compiled default.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub debug_port: Option<u16>,
    pub control_port: Option<u16>,
    pub agent_port: Option<u16>,
    pub extension_port: Option<u16>,
    pub resources_dir: Option<PathBuf>,
    /// Resolve and persist ports but never launch the companion.
    pub disabled: bool,
}

/// Construction parameters for [`Supervisor::spawn`].
pub struct SupervisorConfig {
    pub settings_path: PathBuf,
    pub overrides: Overrides,
    pub socket_factory: Box<dyn DebugSocketFactory>,
    pub liveness_interval: Duration,
    pub health_interval: Duration,
    /// Companion executable; resolved from the resources dir when `None`.
    pub exe_path: Option<PathBuf>,
    /// Execution directory; the per-user default when `None`.
    pub execution_dir: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn new(settings_path: PathBuf, overrides: Overrides) -> Self {
        Self {
            settings_path,
            overrides,
            socket_factory: Box::new(LoopbackSocketFactory),
            liveness_interval: LIVENESS_INTERVAL,
            health_interval: HEALTH_INTERVAL,
            exe_path: None,
            execution_dir: None,
        }
    }
}

enum Msg {
    Start,
    Stop(oneshot::Sender<()>),
    SetFeatureEnabled(bool),
    RestartRequested,
    LaunchFinished(Option<Child>),
    ProcessKilled,
    HealthFinished(bool),
}

/// Handle used by the host and the settings watcher to drive the
/// supervisor. Cheap to clone; the supervisor task tears itself down once
/// every handle is gone.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Msg>,
}

impl SupervisorHandle {
    pub fn start(&self) {
        let _ = self.tx.send(Msg::Start);
    }

    /// Stop the companion and release all resources. Resolves once the
    /// teardown has completed on the control sequence.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Msg::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn set_feature_enabled(&self, enabled: bool) {
        let _ = self.tx.send(Msg::SetFeatureEnabled(enabled));
    }

    pub fn request_restart(&self) {
        let _ = self.tx.send(Msg::RestartRequested);
    }
}

/// The control sequence. Owns every piece of mutable supervisor state.
pub struct Supervisor {
    cfg: SupervisorConfig,
    settings: ServerSettings,
    feature_enabled: bool,
    ports: Option<PortSet>,
    process: Option<Child>,
    lock: Option<SingletonLock>,
    listener: Option<DebugListener>,
    client: Option<ControlClient>,
    is_running: bool,
    is_restarting: bool,
    init_sent: bool,
    launch_pending: bool,
    liveness: Option<Interval>,
    health: Option<Interval>,
    tx: mpsc::WeakUnboundedSender<Msg>,
    rx: mpsc::UnboundedReceiver<Msg>,
}

enum Event {
    Message(Option<Msg>),
    LivenessTick,
    HealthTick,
}

impl Supervisor {
    /// Construct the supervisor task and return the handle driving it.
    pub fn spawn(cfg: SupervisorConfig) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = settings::load(&cfg.settings_path);
        let feature_enabled = settings.control_feature_enabled;

        let supervisor = Supervisor {
            tx: tx.downgrade(),
            rx,
            settings,
            feature_enabled,
            ports: None,
            process: None,
            lock: None,
            listener: None,
            client: None,
            is_running: false,
            is_restarting: false,
            init_sent: false,
            launch_pending: false,
            liveness: None,
            health: None,
            cfg,
        };

        let join = tokio::spawn(supervisor.run());
        (SupervisorHandle { tx }, join)
    }

    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                msg = self.rx.recv() => Event::Message(msg),
                _ = tick(&mut self.liveness) => Event::LivenessTick,
                _ = tick(&mut self.health) => Event::HealthTick,
            };

            match event {
                Event::Message(Some(msg)) => self.handle_msg(msg).await,
                Event::Message(None) => break,
                Event::LivenessTick => self.check_process_status(),
                Event::HealthTick => self.check_server_health(),
            }
        }

        // Every handle is gone; tear down as if stopped.
        self.stop().await;
    }

    async fn handle_msg(&mut self, msg: Msg) {
        match msg {
            Msg::Start => self.start().await,
            Msg::Stop(ack) => {
                self.stop().await;
                let _ = ack.send(());
            }
            Msg::SetFeatureEnabled(enabled) => self.on_feature_enabled_changed(enabled),
            Msg::RestartRequested => self.on_restart_requested(),
            Msg::LaunchFinished(child) => self.on_launch_finished(child),
            Msg::ProcessKilled => self.relaunch_after_kill(),
            Msg::HealthFinished(healthy) => self.on_health_finished(healthy),
        }
    }

    async fn start(&mut self) {
        if self.is_running || self.launch_pending {
            info!("companion server already running");
            return;
        }

        // Ports are resolved and persisted even when launching is disabled,
        // so overrides always land in the settings file.
        self.resolve_and_persist_ports();

        if self.cfg.overrides.disabled {
            info!("companion server launch disabled via command line");
            return;
        }

        if self.lock.is_none() {
            let exec_dir = self.execution_dir();
            let acquired =
                tokio::task::spawn_blocking(move || SingletonLock::acquire_in(&exec_dir)).await;
            match acquired {
                Ok(Ok(Some(lock))) => self.lock = Some(lock),
                // Another host process owns the companion; stay quiet.
                Ok(Ok(None)) => return,
                Ok(Err(err)) => {
                    error!(error = %err, "failed to acquire server lock");
                    return;
                }
                Err(err) => {
                    error!(error = %err, "lock worker failed");
                    return;
                }
            }
        }

        info!("starting companion server");
        self.begin_launch();
    }

    async fn stop(&mut self) {
        info!("stopping companion server");
        self.liveness = None;
        self.health = None;
        self.is_running = false;
        self.is_restarting = false;
        self.init_sent = false;
        self.client = None;

        if let Some(mut child) = self.process.take() {
            let worker = tokio::task::spawn_blocking(move || launcher::kill_and_wait(&mut child));
            if let Err(err) = worker.await {
                warn!(error = %err, "kill worker failed");
            }
        }

        self.listener = None;
        self.lock = None;
    }

    /// Bind the debug listener, post the launch job, arm the health poll.
    /// Shared by `start` and the crash path.
    fn begin_launch(&mut self) {
        let Some(ports) = self.ports else {
            error!("ports not resolved before launch");
            return;
        };

        match self.cfg.socket_factory.bind(ports.debug) {
            Ok(listener) => self.listener = Some(listener),
            Err(err) => {
                error!(port = ports.debug, error = %err, "failed to bind debug socket");
                self.unwind_start();
                return;
            }
        }

        self.spawn_launch(ports);

        if self.health.is_none() {
            self.health = Some(monitor_interval(self.cfg.health_interval));
        }
    }

    fn spawn_launch(&mut self, ports: PortSet) {
        if self.launch_pending {
            warn!("launch already in flight, ignoring");
            return;
        }

        let Some(req) = self.launch_request(ports) else {
            self.on_launch_finished(None);
            return;
        };
        let Some(tx) = self.tx.upgrade() else {
            return;
        };

        self.launch_pending = true;
        tokio::task::spawn_blocking(move || {
            let child = launcher::launch(&req);
            let _ = tx.send(Msg::LaunchFinished(child));
        });
    }

    fn on_launch_finished(&mut self, child: Option<Child>) {
        self.launch_pending = false;

        let Some(child) = child else {
            error!("companion server failed to launch, unwinding start");
            self.unwind_start();
            self.is_restarting = false;
            return;
        };

        if self.lock.is_none() {
            // Stopped while the launch was in flight; don't leave an orphan.
            warn!("launch finished after teardown, killing orphan companion");
            let mut child = child;
            tokio::task::spawn_blocking(move || launcher::kill_and_wait(&mut child));
            return;
        }

        info!(pid = child.id(), "companion server running");
        self.process = Some(child);
        self.is_running = true;
        self.liveness = Some(monitor_interval(self.cfg.liveness_interval));
        if self.health.is_none() {
            self.health = Some(monitor_interval(self.cfg.health_interval));
        }

        self.client = self.ports.and_then(|p| match ControlClient::new(p.control) {
            Ok(client) => Some(client),
            Err(err) => {
                error!(error = %err, "failed to build control client");
                None
            }
        });

        if self.is_restarting {
            self.is_restarting = false;
            if self.settings.restart_requested {
                self.settings.restart_requested = false;
                self.persist_settings();
                info!("restart completed, cleared restart request");
            }
        }

        // The init handshake waits for the first healthy check; only the
        // disable toggle is sent up front, to align a fresh companion that
        // defaults to enabled.
        if !self.feature_enabled {
            self.spawn_toggle(false);
        }
    }

    fn check_process_status(&mut self) {
        if !self.is_running {
            return;
        }
        let Some(child) = self.process.as_mut() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                self.on_process_exited(exit_code);
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to poll companion process"),
        }
    }

    fn on_process_exited(&mut self, exit_code: i32) {
        info!(exit_code, "companion server exited");
        self.is_running = false;
        self.init_sent = false;
        self.process = None;
        self.liveness = None;
        self.health = None;
        self.listener = None;
        self.client = None;

        if exit_code == 0 {
            info!("companion server stopped cleanly, not restarting");
            return;
        }

        warn!(exit_code, "companion server crashed, relaunching");
        // Previous ports may have been claimed while we were down.
        self.resolve_and_persist_ports();
        self.begin_launch();
    }

    fn check_server_health(&mut self) {
        if !self.is_running {
            return;
        }
        if self.process.is_none() {
            warn!("companion process handle is gone, restarting");
            self.restart_server();
            return;
        }

        let Some(client) = self.client.clone() else {
            warn!("control client unavailable, skipping health check");
            return;
        };
        let Some(tx) = self.tx.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            let healthy = client.health().await;
            let _ = tx.send(Msg::HealthFinished(healthy));
        });
    }

    fn on_health_finished(&mut self, healthy: bool) {
        if !self.is_running {
            return;
        }

        if healthy {
            if !self.init_sent {
                self.init_sent = true;
                self.spawn_init();
            }
            return;
        }

        warn!("health check failed, restarting companion server");
        self.restart_server();
    }

    /// Kill the current process and launch a new one with the same ports.
    /// The debug listener and the lock survive the swap.
    fn restart_server(&mut self) {
        info!("restarting companion server process");
        self.liveness = None;
        self.health = None;
        self.is_running = false;
        self.init_sent = false;

        let child = self.process.take();
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        tokio::task::spawn_blocking(move || {
            if let Some(mut child) = child {
                launcher::kill_and_wait(&mut child);
            }
            let _ = tx.send(Msg::ProcessKilled);
        });
    }

    fn relaunch_after_kill(&mut self) {
        if self.lock.is_none() {
            // Stopped while the kill was in flight.
            return;
        }
        let Some(ports) = self.ports else {
            return;
        };
        self.spawn_launch(ports);
    }

    fn on_restart_requested(&mut self) {
        if self.is_restarting {
            info!("restart already in progress, ignoring duplicate request");
            return;
        }
        if !self.is_running {
            warn!("restart requested while companion server is not running");
            if self.settings.restart_requested {
                self.settings.restart_requested = false;
                self.persist_settings();
            }
            return;
        }

        info!("companion server restart requested");
        self.settings.restart_requested = true;
        self.is_restarting = true;
        self.restart_server();
    }

    fn on_feature_enabled_changed(&mut self, enabled: bool) {
        if enabled == self.feature_enabled {
            return;
        }

        info!(enabled, "control feature flag changed");
        self.feature_enabled = enabled;
        self.settings.control_feature_enabled = enabled;
        self.persist_settings();

        if self.is_running {
            self.spawn_toggle(enabled);
        }
    }

    /// Apply override > persisted > default per port, negotiate the
    /// non-overridden ones, and write the outcome back to settings.
    fn resolve_and_persist_ports(&mut self) {
        let overrides = &self.cfg.overrides;

        if overrides.control_port.is_some() && !self.feature_enabled {
            // An explicit control port means the operator wants the feature.
            info!("control port override enables the control feature");
            self.feature_enabled = true;
        }

        let ports = PortSet {
            debug: resolved_or_override(
                overrides.debug_port,
                self.settings.debug_port,
                settings::DEFAULT_DEBUG_PORT,
                "debug",
            ),
            control: resolved_or_override(
                overrides.control_port,
                self.settings.control_port,
                settings::DEFAULT_CONTROL_PORT,
                "control",
            ),
            agent: resolved_or_override(
                overrides.agent_port,
                self.settings.agent_port,
                settings::DEFAULT_AGENT_PORT,
                "agent",
            ),
            extension: resolved_or_override(
                overrides.extension_port,
                self.settings.extension_port,
                settings::DEFAULT_EXTENSION_PORT,
                "extension",
            ),
        };

        info!(
            debug = ports.debug,
            control = ports.control,
            agent = ports.agent,
            extension = ports.extension,
            "resolved companion server ports"
        );

        self.ports = Some(ports);
        self.settings.debug_port = ports.debug;
        self.settings.control_port = ports.control;
        self.settings.agent_port = ports.agent;
        self.settings.extension_port = ports.extension;
        self.settings.control_feature_enabled = self.feature_enabled;
        self.persist_settings();
    }

    fn persist_settings(&self) {
        if let Err(err) = settings::save(&self.cfg.settings_path, &self.settings) {
            warn!(error = %err, "failed to persist settings");
        }
    }

    fn launch_request(&self, ports: PortSet) -> Option<LaunchRequest> {
        let resources_dir = match &self.cfg.overrides.resources_dir {
            Some(dir) => dir.clone(),
            None => match paths::default_resources_dir() {
                Some(dir) => dir,
                None => {
                    error!("failed to resolve companion resources directory");
                    return None;
                }
            },
        };
        let exe_path = self
            .cfg
            .exe_path
            .clone()
            .unwrap_or_else(|| paths::server_executable(&resources_dir));

        Some(LaunchRequest {
            exe_path,
            resources_dir,
            execution_dir: self.execution_dir(),
            ports,
        })
    }

    fn execution_dir(&self) -> PathBuf {
        self.cfg
            .execution_dir
            .clone()
            .unwrap_or_else(paths::execution_dir)
    }

    /// Release everything a partially completed start acquired.
    fn unwind_start(&mut self) {
        self.liveness = None;
        self.health = None;
        self.listener = None;
        self.client = None;
        self.lock = None;
    }

    fn spawn_toggle(&self, enabled: bool) {
        let Some(client) = self.client.clone() else {
            return;
        };
        tokio::spawn(async move { client.set_protocol_enabled(enabled).await });
    }

    fn spawn_init(&self) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let payload = InitPayload::for_install(&self.settings.install_id);
        tokio::spawn(async move { client.send_init(&payload).await });
    }
}

/// Awaits the next tick, or forever when the monitor is disarmed.
async fn tick(slot: &mut Option<Interval>) {
    match slot.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Monitor interval whose first tick fires one full period after arming.
fn monitor_interval(period: Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn resolved_or_override(
    override_port: Option<u16>,
    persisted: u16,
    default: u16,
    name: &str,
) -> u16 {
    if let Some(port) = override_port {
        // Warn about problematic ports but respect explicit intent.
        if ports::is_well_known(port) {
            warn!(port, name, "override is a well-known port and may need elevated privileges");
        } else if !ports::port_allowed(port) {
            warn!(port, name, "override is a restricted port and may interfere with system services");
        }
        info!(port, name, "port overridden via command line");
        return port;
    }

    let preferred = if persisted > 0 { persisted } else { default };
    ports::resolve_port(preferred)
}
