use std::{
    future::Future,
    io,
    os::{
        fd::{AsRawFd, RawFd},
        unix::process::ExitStatusExt,
    },
    path::PathBuf,
    pin::Pin,
    process::{ExitStatus, Stdio},
};

use tokio::{net::UnixStream, process::Command};

use crate::{
    error::{Result, SupervisorError},
    ipc::{IPC_FD, IPC_FD_ENV},
    process_manager::ProcessManager,
};

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Shell-style exit code: a death by signal `n` reads as `128 + n`.
    pub fn effective_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 128,
        }
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

pub type ExitFuture = Pin<Box<dyn Future<Output = WorkerExit> + Send>>;

/// A freshly forked worker: its pid, the master end of its pipe and a
/// future resolving when it exits.
pub struct SpawnedWorker {
    pub pid: i32,
    pub stream: UnixStream,
    pub exit: ExitFuture,
}

/// Creates and kills worker processes on behalf of the supervisor.
pub trait WorkerLauncher: Send {
    fn launch(&mut self, args: &[String]) -> Result<SpawnedWorker>;

    fn terminate(&mut self, pid: i32) -> Result<()>;
}

/// Launches the worker entry executable with the IPC pipe on fd 3.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    base_args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&mut self, args: &[String]) -> Result<SpawnedWorker> {
        let (master_end, worker_end) =
            std::os::unix::net::UnixStream::pair().map_err(SupervisorError::Fork)?;
        let child_fd = worker_end.as_raw_fd();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(args)
            .env(IPC_FD_ENV, IPC_FD.to_string())
            .stdin(Stdio::null());

        unsafe {
            cmd.pre_exec(move || install_pipe(child_fd));
        }

        let mut child = cmd.spawn().map_err(SupervisorError::Fork)?;
        drop(worker_end);

        let pid = child.id().ok_or_else(|| {
            SupervisorError::Fork(io::Error::new(
                io::ErrorKind::Other,
                "worker exited before its pid was read",
            ))
        })? as i32;

        master_end.set_nonblocking(true)?;
        let stream = UnixStream::from_std(master_end)?;

        let exit: ExitFuture = Box::pin(async move {
            match child.wait().await {
                Ok(status) => WorkerExit::from(status),
                Err(_) => WorkerExit {
                    code: None,
                    signal: None,
                },
            }
        });

        Ok(SpawnedWorker { pid, stream, exit })
    }

    fn terminate(&mut self, pid: i32) -> Result<()> {
        ProcessManager::force_kill_process(pid)
    }
}

// Runs in the forked child before exec: only async-signal-safe calls.
fn install_pipe(fd: RawFd) -> io::Result<()> {
    unsafe {
        if fd == IPC_FD {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags == -1 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                return Err(io::Error::last_os_error());
            }
        } else if libc::dup2(fd, IPC_FD) == -1 {
            return Err(io::Error::last_os_error());
        }

        #[cfg(target_os = "linux")]
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
