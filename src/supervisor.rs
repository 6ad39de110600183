//! The master's worker pool.
//!
//! One task owns all pool state. Worker exits, control signals and inbound
//! IPC frames reach it over channels and are handled strictly one at a
//! time, so the shutdown/reboot bookkeeping never races.

use std::{collections::BTreeSet, fmt, time::Duration};

use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::{
    error::{Result, SupervisorError},
    ipc::{InboundMessage, MasterChannel, SHUTDOWN_METHOD},
    launcher::{SpawnedWorker, WorkerExit, WorkerLauncher},
    ledger::{self, SharedLedger},
    log,
    logger::{LogLevel, Logger},
    timestamp::{current_timestamp, format_duration},
};

/// Exit code of a process stopped by SIGINT.
pub const SIGINT_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Starting,
    Steady,
    ShuttingDown,
    Rebooting,
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Starting => "starting",
            PoolState::Steady => "steady",
            PoolState::ShuttingDown => "shutting down",
            PoolState::Rebooting => "rebooting",
            PoolState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGINT / SIGTERM.
    Shutdown,
    /// SIGHUP.
    Reboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Abnormal exit: record it and fork a replacement.
    Crash,
    /// Expected exit: let the pool shrink.
    Clean,
    /// Exit requested by a reboot: fork a replacement, not a crash.
    Replace,
}

/// Decides what a worker exit means. `rebooting` is true when the worker
/// was part of the pool when the current reboot started.
pub fn classify_exit(state: PoolState, rebooting: bool, exit: WorkerExit, debug: bool) -> ExitDecision {
    if rebooting && state == PoolState::Rebooting {
        return ExitDecision::Replace;
    }

    match state {
        PoolState::ShuttingDown | PoolState::Stopped => ExitDecision::Clean,
        _ => {
            let code = exit.effective_code();
            if code != 0 && code != SIGINT_EXIT_CODE && !debug {
                ExitDecision::Crash
            } else {
                ExitDecision::Clean
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub context: String,
    pub workers: usize,
    pub debug: bool,
    /// Kill workers still alive this long after a shutdown broadcast.
    pub shutdown_timeout: Option<Duration>,
    /// Stop replacing crashed workers past this many crashes per window.
    /// Zero disables the guard.
    pub restart_limit: usize,
    pub restart_window: Duration,
}

impl SupervisorOptions {
    pub fn new(context: impl Into<String>, workers: usize) -> Self {
        Self {
            context: context.into(),
            workers,
            debug: false,
            shutdown_timeout: Some(Duration::from_secs(10)),
            restart_limit: 10,
            restart_window: Duration::from_secs(60),
        }
    }

    /// Arguments every worker is launched with.
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = vec!["--context".to_string(), self.context.clone()];
        if self.debug {
            args.push("--debug".to_string());
        }
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorReport {
    pub crashes: usize,
    pub restarts: u64,
}

#[derive(Debug)]
enum SupervisorEvent {
    Exited { pid: i32, exit: WorkerExit },
    Control(ControlSignal),
    Deadline { generation: u64 },
}

/// Cloneable way to poke a running supervisor from signal handlers or tests.
#[derive(Clone)]
pub struct SupervisorHandle {
    events: mpsc::UnboundedSender<SupervisorEvent>,
    state: watch::Receiver<PoolState>,
}

impl SupervisorHandle {
    pub fn shutdown(&self) -> bool {
        self.events
            .send(SupervisorEvent::Control(ControlSignal::Shutdown))
            .is_ok()
    }

    pub fn reboot(&self) -> bool {
        self.events
            .send(SupervisorEvent::Control(ControlSignal::Reboot))
            .is_ok()
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    /// Waits until the pool reaches `state`. Fails if the supervisor is gone.
    pub async fn wait_for(&mut self, state: PoolState) -> Result<()> {
        self.state
            .wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| SupervisorError::ChannelClosed)
    }
}

pub struct Supervisor<L: WorkerLauncher> {
    options: SupervisorOptions,
    launcher: L,
    channel: MasterChannel,
    ledger: SharedLedger,
    logger: Logger,
    state: PoolState,
    state_tx: watch::Sender<PoolState>,
    workers: BTreeSet<i32>,
    rebooting: BTreeSet<i32>,
    deadline_generation: u64,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    events_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: mpsc::UnboundedReceiver<InboundMessage>,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(
        options: SupervisorOptions,
        launcher: L,
        channel: MasterChannel,
        ledger: SharedLedger,
        logger: Logger,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(PoolState::Starting);

        Self {
            options,
            launcher,
            channel,
            ledger,
            logger,
            state: PoolState::Starting,
            state_tx,
            workers: BTreeSet::new(),
            rebooting: BTreeSet::new(),
            deadline_generation: 0,
            events_tx,
            events_rx,
            inbound_tx,
            inbound_rx,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            events: self.events_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    pub fn channel(&self) -> &MasterChannel {
        &self.channel
    }

    /// Forks the initial pool and processes events until the pool stops.
    pub async fn run(mut self) -> Result<SupervisorReport> {
        log!(
            self.logger,
            LogLevel::Info,
            "Starting {} workers for context {}",
            self.options.workers,
            self.options.context
        );

        for _ in 0..self.options.workers {
            if let Err(err) = self.fork() {
                log!(self.logger, LogLevel::Error, "Startup aborted: {}", err);
                for pid in self.workers.clone() {
                    let _ = self.launcher.terminate(pid);
                }
                self.set_state(PoolState::Stopped);
                return Err(err);
            }
        }
        self.set_state(PoolState::Steady);

        while self.state != PoolState::Stopped {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(inbound) = self.inbound_rx.recv() => self.channel.dispatch(inbound),
                else => break,
            }
        }

        let ledger = ledger::lock(&self.ledger);
        log!(
            self.logger,
            LogLevel::Info,
            "Pool for context {} stopped after {} ({} crashes, {} restarts)",
            self.options.context,
            format_duration(ledger.summary().uptime_secs),
            ledger.crashes().len(),
            ledger.restarts()
        );
        Ok(SupervisorReport {
            crashes: ledger.crashes().len(),
            restarts: ledger.restarts(),
        })
    }

    fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Exited { pid, exit } => self.on_exit(pid, exit),
            SupervisorEvent::Control(ControlSignal::Shutdown) => self.on_shutdown(),
            SupervisorEvent::Control(ControlSignal::Reboot) => self.on_reboot(),
            SupervisorEvent::Deadline { generation } => self.on_deadline(generation),
        }
    }

    fn on_exit(&mut self, pid: i32, exit: WorkerExit) {
        self.channel.remove_process(pid);
        self.workers.remove(&pid);
        ledger::lock(&self.ledger).worker_exited(pid);
        let rebooting = self.rebooting.remove(&pid);

        match classify_exit(self.state, rebooting, exit, self.options.debug) {
            ExitDecision::Crash => {
                log!(
                    self.logger,
                    LogLevel::Warn,
                    "Worker {} crashed with exit code {}",
                    pid,
                    exit.effective_code()
                );
                let recent = {
                    let mut ledger = ledger::lock(&self.ledger);
                    ledger.record_crash(pid, exit.code, exit.signal);
                    ledger.recent_crashes(self.options.restart_window.as_secs(), current_timestamp())
                };
                if self.options.restart_limit > 0 && recent > self.options.restart_limit {
                    log!(
                        self.logger,
                        LogLevel::Error,
                        "{} crashes within {:?}, not replacing worker {} ({} left)",
                        recent,
                        self.options.restart_window,
                        pid,
                        self.workers.len()
                    );
                } else {
                    self.respawn();
                }
            }
            ExitDecision::Replace => {
                log!(self.logger, LogLevel::Info, "Worker {} stopped for reboot", pid);
                self.respawn();
            }
            ExitDecision::Clean => {
                log!(
                    self.logger,
                    LogLevel::Info,
                    "Worker {} exited with code {}",
                    pid,
                    exit.effective_code()
                );
            }
        }

        if self.state == PoolState::Rebooting && self.rebooting.is_empty() {
            log!(self.logger, LogLevel::Info, "Reboot complete");
            self.set_state(PoolState::Steady);
        }
        if self.state == PoolState::ShuttingDown && self.workers.is_empty() {
            self.set_state(PoolState::Stopped);
        }
    }

    fn on_shutdown(&mut self) {
        match self.state {
            PoolState::ShuttingDown | PoolState::Stopped => {
                log!(self.logger, LogLevel::Debug, "Shutdown already in progress");
            }
            _ => {
                log!(
                    self.logger,
                    LogLevel::Info,
                    "Graceful shutdown of {} workers",
                    self.workers.len()
                );
                self.rebooting.clear();
                self.set_state(PoolState::ShuttingDown);
                self.channel
                    .broadcast(SHUTDOWN_METHOD, json!({ "reason": "shutdown" }));
                if self.workers.is_empty() {
                    self.set_state(PoolState::Stopped);
                } else {
                    self.arm_deadline();
                }
            }
        }
    }

    fn on_reboot(&mut self) {
        match self.state {
            PoolState::Steady if !self.workers.is_empty() => {
                log!(
                    self.logger,
                    LogLevel::Info,
                    "Graceful reboot of {} workers",
                    self.workers.len()
                );
                self.rebooting = self.workers.clone();
                self.set_state(PoolState::Rebooting);
                self.channel
                    .broadcast(SHUTDOWN_METHOD, json!({ "reason": "reboot" }));
                self.arm_deadline();
            }
            state => {
                log!(self.logger, LogLevel::Info, "Ignoring reboot while pool is {}", state);
            }
        }
    }

    fn on_deadline(&mut self, generation: u64) {
        if generation != self.deadline_generation {
            return;
        }
        let overdue: Vec<i32> = match self.state {
            PoolState::ShuttingDown => self.workers.iter().copied().collect(),
            PoolState::Rebooting => self.rebooting.intersection(&self.workers).copied().collect(),
            _ => Vec::new(),
        };

        for pid in overdue {
            log!(
                self.logger,
                LogLevel::Warn,
                "Worker {} still running after {:?}, killing it",
                pid,
                self.options.shutdown_timeout.unwrap_or_default()
            );
            if let Err(err) = self.launcher.terminate(pid) {
                log!(self.logger, LogLevel::Error, "Failed to kill worker {}: {}", pid, err);
            }
        }
    }

    fn arm_deadline(&mut self) {
        let Some(timeout) = self.options.shutdown_timeout else {
            return;
        };
        self.deadline_generation += 1;
        let generation = self.deadline_generation;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(SupervisorEvent::Deadline { generation });
        });
    }

    fn respawn(&mut self) {
        match self.fork() {
            Ok(_) => ledger::lock(&self.ledger).record_restart(),
            Err(err) => log!(
                self.logger,
                LogLevel::Error,
                "Failed to fork replacement worker ({} left): {}",
                self.workers.len(),
                err
            ),
        }
    }

    fn fork(&mut self) -> Result<i32> {
        let SpawnedWorker { pid, stream, exit } =
            self.launcher.launch(&self.options.worker_args())?;

        self.channel.add_process(pid, stream, self.inbound_tx.clone());
        self.workers.insert(pid);
        ledger::lock(&self.ledger).worker_started(pid);

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let exit = exit.await;
            let _ = events.send(SupervisorEvent::Exited { pid, exit });
        });

        log!(self.logger, LogLevel::Info, "Forked worker {}", pid);
        Ok(pid)
    }

    fn set_state(&mut self, state: PoolState) {
        if self.state != state {
            log!(self.logger, LogLevel::Debug, "Pool {} -> {}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }
}
