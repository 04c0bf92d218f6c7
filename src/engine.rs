/// Engine lifecycle
///
/// One control task owns the tunnel device, the pump task and every
/// state transition. Control commands and OS network callbacks arrive
/// over a bounded queue and are processed strictly in order; the pump
/// reports back over an internal event channel.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::blocklog::{self, BlockLog, BlockLogEntry};
use crate::config::ConfigSnapshot;
use crate::error::{GarmError, Result};
use crate::pump::{Pump, PumpContext, PumpEvent};
use crate::rules::RuleTable;
use crate::stats::EngineStats;
use crate::status::{EngineState, Status, StatusReporter};
use crate::tun::{TunConfig, TunDevice, TunProvider};
use crate::upstream::{self, SocketProtector, UpstreamPool};

const CONTROL_QUEUE: usize = 16;
const CONTROL_OFFER_TIMEOUT: Duration = Duration::from_secs(1);
const EVENT_QUEUE: usize = 32;
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Control commands and network callbacks.
///
/// `Pause` stops the engine like `Stop` but leaves the persisted
/// active flag set, so an external UI can offer a resume and the
/// autostart gate still fires; `Resume` is `Start`. The engine itself
/// never reads the flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Pause,
    Resume,
    NetworkLost,
    NetworkAvailable,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::NetworkLost => "network-lost",
            Command::NetworkAvailable => "network-available",
        };
        write!(f, "{name}")
    }
}

/// Where the engine keeps state across runs.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub block_log: PathBuf,
    pub active_flag: PathBuf,
}

impl StatePaths {
    pub fn in_dir(dir: &Path) -> StatePaths {
        StatePaths {
            block_log: dir.join("block-log.json"),
            active_flag: dir.join("active"),
        }
    }
}

/// Read the persisted active flag for the autostart gate.
pub fn read_active_flag(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|s| s.trim() == "true")
        .unwrap_or(false)
}

fn write_active_flag(path: &Path, active: bool) {
    if let Err(e) = std::fs::write(path, if active { "true" } else { "false" }) {
        warn!("Failed to persist active flag: {e}");
    }
}

/// External collaborators the engine needs at start.
pub struct EngineOptions {
    pub tun_provider: Arc<dyn TunProvider>,
    pub protector: Arc<SocketProtector>,
    /// Resolvers inherited from the underlying link, used when the
    /// configured list is empty or fully disabled.
    pub system_dns: Vec<SocketAddr>,
    pub paths: StatePaths,
    pub tun_name: String,
}

/// Handle to a running engine control task.
pub struct Engine {
    control_tx: mpsc::Sender<Command>,
    reporter: StatusReporter,
    stats: Arc<EngineStats>,
    block_log: Arc<Mutex<BlockLog>>,
    task: JoinHandle<()>,
}

impl Engine {
    /// Spawn the control task. The engine starts in `Stopped` and
    /// waits for a `Start` command.
    pub fn spawn(config: ConfigSnapshot, options: EngineOptions) -> Engine {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (reporter, _) = StatusReporter::new();
        let stats = Arc::new(EngineStats::new());
        let block_log = Arc::new(Mutex::new(BlockLog::new()));

        let runner = Runner {
            config,
            provider: options.tun_provider,
            protector: options.protector,
            system_dns: options.system_dns,
            paths: options.paths,
            tun_name: options.tun_name,
            reporter: reporter.clone(),
            stats: stats.clone(),
            block_log: block_log.clone(),
            events_tx,
            rules: None,
            tun: None,
            pump: None,
            generation: 0,
            backoff: INITIAL_BACKOFF,
            reconnect_at: None,
        };

        let task = tokio::spawn(runner.run(control_rx, events_rx));

        Engine {
            control_tx,
            reporter,
            stats,
            block_log,
            task,
        }
    }

    /// Enqueue a control command. Fails when the queue stays full past
    /// the offer timeout; the command is dropped with a warning.
    pub async fn command(&self, command: Command) -> Result<()> {
        self.control_tx
            .send_timeout(command, CONTROL_OFFER_TIMEOUT)
            .await
            .map_err(|_| {
                warn!("Control queue full, dropping {command}");
                GarmError::ControlQueueFull
            })
    }

    /// Subscribe to status. The receiver sees the current value
    /// immediately and the latest value after any burst of changes.
    pub fn status(&self) -> watch::Receiver<Status> {
        self.reporter.subscribe()
    }

    pub fn state(&self) -> EngineState {
        self.reporter.state()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    pub fn block_log_snapshot(&self) -> Vec<BlockLogEntry> {
        self.block_log.lock().snapshot()
    }

    /// Release the handle and wait for the control task to wind down.
    /// A running engine is stopped on the way out.
    pub async fn join(self) {
        drop(self.control_tx);
        if let Err(e) = self.task.await {
            error!("Engine control task failed: {e}");
        }
    }
}

struct PumpHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Runner {
    config: ConfigSnapshot,
    provider: Arc<dyn TunProvider>,
    protector: Arc<SocketProtector>,
    system_dns: Vec<SocketAddr>,
    paths: StatePaths,
    tun_name: String,
    reporter: StatusReporter,
    stats: Arc<EngineStats>,
    block_log: Arc<Mutex<BlockLog>>,
    events_tx: mpsc::Sender<(u64, PumpEvent)>,
    rules: Option<Arc<RuleTable>>,
    tun: Option<Arc<dyn TunDevice>>,
    pump: Option<PumpHandle>,
    generation: u64,
    backoff: Duration,
    reconnect_at: Option<Instant>,
}

impl Runner {
    async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<Command>,
        mut events_rx: mpsc::Receiver<(u64, PumpEvent)>,
    ) {
        loop {
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                maybe_command = control_rx.recv() => match maybe_command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Handle dropped; wind down
                        if self.reporter.state() != EngineState::Stopped {
                            self.do_stop(None).await;
                        }
                        break;
                    }
                },

                Some((generation, event)) = events_rx.recv() => {
                    if generation == self.generation {
                        self.handle_event(event).await;
                    } else {
                        debug!("Ignoring stale pump event from generation {generation}");
                    }
                }

                _ = async move {
                    match reconnect_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.reconnect_at = None;
                    self.reconnect();
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let state = self.reporter.state();
        match (command, state) {
            (Command::Start | Command::Resume, EngineState::Stopped) => {
                self.do_start().await;
            }
            (Command::Stop, s) if s != EngineState::Stopped && s != EngineState::Stopping => {
                self.do_stop(None).await;
            }
            (Command::Pause, s) if s != EngineState::Stopped && s != EngineState::Stopping => {
                self.do_pause().await;
            }
            (
                Command::NetworkLost,
                EngineState::Running
                | EngineState::Reconnecting
                | EngineState::ReconnectingNetworkError,
            ) => {
                self.network_lost().await;
            }
            (Command::NetworkAvailable, EngineState::WaitingForNetwork) => {
                self.network_available();
            }
            (command, state) => {
                debug!("Ignoring {command} in state {state}");
            }
        }
    }

    async fn handle_event(&mut self, event: PumpEvent) {
        let state = self.reporter.state();
        match event {
            PumpEvent::Entered => {
                if state == EngineState::Starting {
                    self.reporter.transition(EngineState::Running);
                }
            }
            PumpEvent::UpstreamOk => {
                if matches!(
                    state,
                    EngineState::Reconnecting | EngineState::ReconnectingNetworkError
                ) {
                    self.reporter.transition(EngineState::Running);
                }
            }
            PumpEvent::RoundTrip => {
                self.backoff = INITIAL_BACKOFF;
            }
            PumpEvent::NetworkError => {
                if matches!(
                    state,
                    EngineState::Starting
                        | EngineState::Running
                        | EngineState::Reconnecting
                        | EngineState::ReconnectingNetworkError
                ) {
                    self.stop_pump().await;
                    self.schedule_reconnect();
                }
            }
            PumpEvent::Fatal(reason) => {
                error!("Fatal tunnel error: {reason}");
                self.do_stop(Some(reason)).await;
            }
        }
    }

    async fn do_start(&mut self) {
        if let Err(e) = self.config.validate() {
            // Refused: no tunnel fd is created
            self.reporter
                .transition_with_reason(EngineState::Stopped, e.to_string());
            return;
        }

        self.reporter.transition(EngineState::Starting);

        let sources = self.config.host_sources.clone();
        let rules = match tokio::task::spawn_blocking(move || RuleTable::from_sources(&sources))
            .await
        {
            Ok(table) => Arc::new(table),
            Err(e) => {
                self.reporter.transition_with_reason(
                    EngineState::Stopped,
                    format!("rule table build failed: {e}"),
                );
                return;
            }
        };
        info!("Rule table ready with {} entries", rules.len());
        self.rules = Some(rules);

        if self.config.block_logging {
            match BlockLog::load(&self.paths.block_log, blocklog::DEFAULT_CAPACITY) {
                Ok(log) => {
                    info!("Restored {} block log entries", log.len());
                    *self.block_log.lock() = log;
                }
                Err(e) => debug!("No previous block log restored: {e}"),
            }
        }

        let tun_config = TunConfig::from_snapshot(&self.config, self.tun_name.clone());
        match self.provider.open(&tun_config) {
            Ok(tun) => self.tun = Some(tun),
            Err(e) => {
                self.rules = None;
                self.reporter
                    .transition_with_reason(EngineState::Stopped, e.to_string());
                return;
            }
        }

        write_active_flag(&self.paths.active_flag, true);
        self.backoff = INITIAL_BACKOFF;
        self.start_pump();
        // Running is published once the pump reports in
    }

    async fn do_stop(&mut self, reason: Option<String>) {
        self.wind_down(reason, false).await;
    }

    /// Stop, but leave the persisted active flag set: the difference
    /// an external UI reads to offer "resume" instead of "start", and
    /// what keeps the autostart gate armed.
    async fn do_pause(&mut self) {
        self.wind_down(None, true).await;
    }

    async fn wind_down(&mut self, reason: Option<String>, resumable: bool) {
        self.reporter.transition(EngineState::Stopping);
        self.reconnect_at = None;
        self.stop_pump().await;

        if self.config.block_logging {
            let persisted = self.block_log.lock().persist(&self.paths.block_log);
            if let Err(e) = persisted {
                warn!("{e}");
                self.reporter.warn(e.to_string());
            }
        }

        // Both descriptors are gone before Stopped is published: the
        // upstream socket died with the pump, the tunnel fd here.
        self.tun = None;
        self.rules = None;
        self.backoff = INITIAL_BACKOFF;
        write_active_flag(&self.paths.active_flag, resumable);

        match reason {
            Some(reason) => self
                .reporter
                .transition_with_reason(EngineState::Stopped, reason),
            None => self.reporter.transition(EngineState::Stopped),
        }
    }

    /// The default underlying network is gone: stop the pump but keep
    /// the tunnel, so apps keep routing DNS at us until it returns.
    async fn network_lost(&mut self) {
        info!("Default network lost");
        self.reconnect_at = None;
        self.stop_pump().await;
        self.reporter.transition(EngineState::WaitingForNetwork);
    }

    fn network_available(&mut self) {
        info!("Default network available again");
        self.reporter.transition(EngineState::Reconnecting);
        self.start_pump();
    }

    fn reconnect(&mut self) {
        if self.reporter.state() != EngineState::ReconnectingNetworkError {
            return;
        }
        if self.pump.is_some() || self.tun.is_none() {
            return;
        }
        info!("Attempting reconnect");
        self.start_pump();
    }

    fn schedule_reconnect(&mut self) {
        self.reporter
            .transition(EngineState::ReconnectingNetworkError);
        let delay = self.backoff;
        self.reconnect_at = Some(Instant::now() + delay);
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        info!("Reconnecting in {delay:?}");
    }

    /// Create the protected upstream socket and spawn a fresh pump
    /// over the existing tunnel device.
    fn start_pump(&mut self) {
        let Some(tun) = self.tun.clone() else {
            return;
        };

        let socket = match upstream::bind_upstream_socket(self.protector.as_ref()) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                // Includes protection failure: never send DNS through
                // our own tunnel, back off and retry instead.
                warn!("Failed to create protected upstream socket: {e}");
                self.schedule_reconnect();
                return;
            }
        };

        let resolvers = match self.config.enabled_resolvers() {
            Ok(resolvers) => resolvers,
            Err(e) => {
                warn!("Upstream configuration rejected: {e}");
                vec![]
            }
        };
        let pool = UpstreamPool::new(resolvers, self.system_dns.clone());
        if pool.is_empty() {
            warn!("No upstream resolver configured and none inherited; only DENY rules will answer");
        }

        self.generation += 1;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = Pump::new(PumpContext {
            tun,
            upstream: socket,
            rules: self.rules.clone().unwrap_or_default(),
            pool,
            block_log: self.block_log.clone(),
            stats: self.stats.clone(),
            events: self.events_tx.clone(),
            generation: self.generation,
            shutdown: shutdown_rx,
            ipv6_enabled: self.config.ipv6_enabled,
            block_logging: self.config.block_logging,
        });

        let task = tokio::spawn(pump.run());
        self.pump = Some(PumpHandle {
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Signal the pump and join it with a deadline; a stuck pump is
    /// aborted and logged as an error.
    async fn stop_pump(&mut self) {
        let Some(handle) = self.pump.take() else {
            return;
        };

        let _ = handle.shutdown.send(true);
        let abort = handle.task.abort_handle();

        match tokio::time::timeout(PUMP_JOIN_TIMEOUT, handle.task).await {
            Ok(Ok(())) => debug!("Pump stopped"),
            Ok(Err(e)) => error!("Pump task failed: {e}"),
            Err(_) => {
                error!("Pump did not stop within {PUMP_JOIN_TIMEOUT:?}, abandoning it");
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_flag_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active");

        assert!(!read_active_flag(&path));
        write_active_flag(&path, true);
        assert!(read_active_flag(&path));
        write_active_flag(&path, false);
        assert!(!read_active_flag(&path));
    }

    #[test]
    fn test_state_paths_layout() {
        let paths = StatePaths::in_dir(Path::new("/var/lib/garm"));
        assert_eq!(paths.block_log, Path::new("/var/lib/garm/block-log.json"));
        assert_eq!(paths.active_flag, Path::new("/var/lib/garm/active"));
    }
}
