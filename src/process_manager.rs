use std::{
    fs::OpenOptions,
    io,
    os::unix::process::CommandExt,
    path::Path,
    process::{Command, ExitStatus, Stdio},
};

use nix::{
    errno::Errno,
    sys::signal::{kill, signal, SigHandler, Signal},
    unistd::Pid,
};

use crate::error::{Result, SupervisorError};

pub struct ProcessManager;

impl ProcessManager {
    /// Check if a process is running based on its PID
    pub fn is_process_running(pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        // Signal 0 only probes; EPERM still means the pid exists.
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Send a specific signal to a process
    pub fn send_signal(pid: i32, signal: Signal) -> Result<()> {
        if pid <= 0 {
            return Err(SupervisorError::SignalDelivery {
                pid,
                signal: signal.as_str().to_owned(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal a process group"),
            });
        }
        kill(Pid::from_raw(pid), signal).map_err(|errno| SupervisorError::SignalDelivery {
            pid,
            signal: signal.as_str().to_owned(),
            source: io::Error::from(errno),
        })
    }

    /// Force kill a process using SIGKILL
    pub fn force_kill_process(pid: i32) -> Result<()> {
        Self::send_signal(pid, Signal::SIGKILL)
    }

    /// Starts `program` detached from the calling terminal: new session,
    /// no stdin/stdout, stderr appended to `log_file`. Returns the child pid.
    pub fn spawn_detached(program: &Path, args: &[String], log_file: &Path) -> Result<u32> {
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new().create(true).append(true).open(log_file)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));

        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(SupervisorError::Fork)?;
        Ok(child.id())
    }

    /// Runs `program` attached to the current terminal and waits for it.
    ///
    /// Ctrl-C reaches the whole foreground group; the caller ignores it so it
    /// can report how `program` ended.
    pub fn run_foreground(program: &Path, args: &[String]) -> Result<ExitStatus> {
        let previous = unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) }
            .map_err(|errno| SupervisorError::Io(io::Error::from(errno)))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        unsafe {
            cmd.pre_exec(move || {
                // The ignored disposition would otherwise survive exec.
                if libc::signal(libc::SIGINT, libc::SIG_DFL) == libc::SIG_ERR {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let status = cmd.status();
        unsafe {
            let _ = signal(Signal::SIGINT, previous);
        }
        Ok(status?)
    }

    /// Get the status of a running process by its PID
    #[cfg(target_os = "linux")]
    pub fn get_process_status(pid: i32) -> Result<String> {
        let stat = procfs::process::Process::new(pid)?.stat()?;
        Ok(stat
            .state()
            .map(|state| format!("{:?}", state))
            .unwrap_or_else(|_| "Unknown".to_string()))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn get_process_status(_pid: i32) -> Result<String> {
        Ok("Unknown".to_string())
    }
}
