//! In-worker counterpart of the supervisor.

use std::{
    future::Future,
    os::fd::{FromRawFd, RawFd},
    sync::Arc,
    time::Duration,
};

use serde_json::json;
use tokio::{net::UnixStream, sync::watch};

use crate::{
    error::{Result, SupervisorError},
    handlers::{logger::LOG_METHOD, metrics::INCREMENT_METHOD},
    ipc::{WorkerChannel, IPC_FD_ENV, SHUTDOWN_METHOD},
    logger::{ConsoleSink, LogLevel, LogSink, Logger},
};

/// Forwards log records to the master. Falls back to stderr once the
/// master is gone.
pub struct IpcLogSink {
    channel: WorkerChannel,
    fallback: ConsoleSink,
}

impl IpcLogSink {
    pub fn new(channel: WorkerChannel) -> Self {
        Self {
            channel,
            fallback: ConsoleSink::new(),
        }
    }
}

impl LogSink for IpcLogSink {
    fn write(&self, level: LogLevel, message: &str) {
        let record = json!({ "level": level.as_str(), "message": message });
        if self.channel.is_closed() || self.channel.notify(LOG_METHOD, record).is_err() {
            self.fallback.write(level, message);
        }
    }
}

pub struct WorkerRuntime {
    context: String,
    debug: bool,
    channel: WorkerChannel,
    logger: Logger,
    shutdown: watch::Receiver<bool>,
}

impl WorkerRuntime {
    /// Opens the pipe inherited from the master. Must run before any other
    /// worker setup.
    pub fn connect(context: &str, debug: bool, level: LogLevel) -> Result<Self> {
        let fd: RawFd = std::env::var(IPC_FD_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| {
                SupervisorError::Config(format!(
                    "{} is not set; workers are started by their master",
                    IPC_FD_ENV
                ))
            })?;

        // The master installed the pipe at this descriptor and nothing else owns it.
        let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;

        Self::from_stream(stream, std::process::id() as i32, context, debug, level)
    }

    pub fn from_stream(
        stream: UnixStream,
        pid: i32,
        context: &str,
        debug: bool,
        level: LogLevel,
    ) -> Result<Self> {
        let channel = WorkerChannel::open(stream, pid);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let on_broadcast = shutdown_tx.clone();
        channel.add_broadcast_listener(SHUTDOWN_METHOD, move |_| {
            on_broadcast.send_replace(true);
        })?;

        // A vanished master means nobody is left to tell us to stop.
        let watched = channel.clone();
        tokio::spawn(async move {
            watched.closed().await;
            shutdown_tx.send_replace(true);
        });

        let logger = Logger::new(level, Arc::new(IpcLogSink::new(channel.clone())));

        Ok(Self {
            context: context.to_string(),
            debug,
            channel,
            logger,
            shutdown,
        })
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn channel(&self) -> &WorkerChannel {
        &self.channel
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the master broadcast `shutdown` or went away.
    pub async fn shutdown_requested(&self) {
        let mut shutdown = self.shutdown.clone();
        let _ = shutdown.wait_for(|requested| *requested).await;
    }

    /// Bumps a master-side counter without waiting for the new value.
    pub fn increment(&self, metric: &str) -> Result<()> {
        self.channel
            .notify(INCREMENT_METHOD, json!({ "name": metric, "by": 1 }))
    }

    /// Waits for `close` (the listener shutting down), then for every record
    /// queued so far to reach the master. The worker may exit with code 0
    /// once this returns.
    pub async fn close_after<F>(self, close: F)
    where
        F: Future<Output = ()>,
    {
        close.await;
        // Never wait on a stuck pipe.
        let _ = tokio::time::timeout(Duration::from_secs(1), self.channel.flush()).await;
    }
}
