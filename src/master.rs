//! Master entry point: one supervised pool for one context.

use std::time::Duration;

use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
};

use crate::{
    config::Settings,
    error::Result,
    handlers,
    ipc::MasterChannel,
    launcher::CommandLauncher,
    ledger::Ledger,
    log,
    logger::{LogLevel, Logger},
    supervisor::{ControlSignal, Supervisor, SupervisorHandle, SupervisorOptions, SupervisorReport},
};

/// Runs the master for `context_name` until its pool has stopped.
pub async fn run_master(settings: &Settings, context_name: &str, debug: bool) -> Result<SupervisorReport> {
    let context = settings.context(context_name)?;
    let debug = debug || settings.debug;
    let logger = Logger::console(settings.log_level(debug)).with_prefix(format!("master {}", context.name));

    let ledger = Ledger::shared();
    let registry = handlers::builtin_registry(&logger, &ledger)?;
    log!(logger, LogLevel::Debug, "IPC methods: {}", registry.names().join(", "));
    let channel = MasterChannel::new(registry, logger.clone());
    let launcher = CommandLauncher::new(settings.worker_program()?, settings.worker_args.clone());
    log!(
        logger,
        LogLevel::Info,
        "Master {} up (worker entry {})",
        std::process::id(),
        launcher.program().display()
    );

    let options = SupervisorOptions {
        context: context.name.clone(),
        workers: context.workers,
        debug,
        shutdown_timeout: settings.shutdown_timeout(),
        restart_limit: settings.restart_limit,
        restart_window: Duration::from_secs(settings.restart_window_secs),
    };

    let supervisor = Supervisor::new(options, launcher, channel, ledger, logger.clone());
    let signals = forward_signals(supervisor.handle(), logger.clone())?;
    let report = supervisor.run().await;
    signals.abort();
    report
}

/// SIGINT/SIGTERM become a graceful shutdown, SIGHUP a graceful reboot.
pub fn forward_signals(handle: SupervisorHandle, logger: Logger) -> Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let (name, control) = tokio::select! {
                _ = interrupt.recv() => ("SIGINT", ControlSignal::Shutdown),
                _ = terminate.recv() => ("SIGTERM", ControlSignal::Shutdown),
                _ = hangup.recv() => ("SIGHUP", ControlSignal::Reboot),
            };
            log!(logger, LogLevel::Info, "Received {}", name);

            let delivered = match control {
                ControlSignal::Shutdown => handle.shutdown(),
                ControlSignal::Reboot => handle.reboot(),
            };
            if !delivered {
                break;
            }
        }
    }))
}
