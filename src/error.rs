use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no worker registered with pid {0}")]
    UnknownPeer(i32),

    #[error("no handler registered for method {0:?}")]
    UnregisteredMethod(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to deliver {signal} to pid {pid}: {source}")]
    SignalDelivery {
        pid: i32,
        signal: String,
        #[source]
        source: io::Error,
    },

    #[error("pid file {} names pid {pid}, which is not running", .path.display())]
    StalePidFile { path: PathBuf, pid: i32 },

    #[error("pid file {} does not exist", .0.display())]
    MissingPidFile(PathBuf),

    #[error("failed to fork worker: {0}")]
    Fork(#[source] io::Error),

    #[error("ipc channel closed")]
    ChannelClosed,

    #[error("ipc frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("unknown context {0:?}")]
    UnknownContext(String),

    #[error("remote handler failed: {0}")]
    Remote(String),

    #[error("process introspection failed: {0}")]
    Procfs(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<config::ConfigError> for SupervisorError {
    fn from(err: config::ConfigError) -> Self {
        SupervisorError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for SupervisorError {
    fn from(err: toml::de::Error) -> Self {
        SupervisorError::Config(err.to_string())
    }
}

#[cfg(target_os = "linux")]
impl From<procfs::ProcError> for SupervisorError {
    fn from(err: procfs::ProcError) -> Self {
        SupervisorError::Procfs(err.to_string())
    }
}

impl SupervisorError {
    /// A bad frame that left the stream in sync; the pipe stays usable.
    pub fn is_frame_error(&self) -> bool {
        matches!(self, SupervisorError::FrameTooLarge(_) | SupervisorError::Json(_))
    }
}
