//! start / stop / reload / status for contexts, driven purely by PID files
//! and signals. Every operation reports an [`Outcome`]; none aborts a batch.

use std::{fmt, process::Command as ProcessCommand};

use nix::sys::signal::Signal;

use crate::{
    config::Settings,
    context::{Context, PidFile},
    error::{Result, SupervisorError},
    process_manager::ProcessManager,
    resource_monitor::{format_megabytes, ProcessTree},
};

/// The OS operations the controller needs.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessControl {
    fn is_alive(&self, pid: i32) -> bool;

    fn signal(&self, pid: i32, signal: Signal) -> Result<()>;

    /// Starts the context's master detached; returns its pid.
    fn spawn_detached(&self, context: &Context) -> Result<u32>;

    /// Runs the context's master in debug mode on this terminal; returns its
    /// exit code.
    fn run_foreground(&self, context: &Context) -> Result<i32>;

    /// Runs the context's master in debug mode in a new multiplexer window.
    fn open_tab(&self, context: &Context) -> Result<()>;

    fn inspect(&self, pid: i32) -> Result<ProcessTree>;
}

pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    fn is_alive(&self, pid: i32) -> bool {
        ProcessManager::is_process_running(pid)
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        ProcessManager::send_signal(pid, signal)
    }

    fn spawn_detached(&self, context: &Context) -> Result<u32> {
        ProcessManager::spawn_detached(&context.entry, &context.master_args(false), &context.log_file)
    }

    fn run_foreground(&self, context: &Context) -> Result<i32> {
        let status = ProcessManager::run_foreground(&context.entry, &context.master_args(true))?;
        Ok(status.code().unwrap_or(1))
    }

    fn open_tab(&self, context: &Context) -> Result<()> {
        let status = ProcessCommand::new("tmux")
            .arg("new-window")
            .arg("-n")
            .arg(&context.name)
            .arg(&context.entry)
            .args(context.master_args(true))
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(SupervisorError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("tmux new-window exited with {}", status),
            )))
        }
    }

    fn inspect(&self, pid: i32) -> Result<ProcessTree> {
        ProcessTree::collect(pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start { debug: bool },
    Stop { force: bool },
    Reload,
    Status,
}

#[derive(Debug)]
pub enum Outcome {
    Started { pid: u32 },
    AlreadyRunning { pid: i32 },
    Foreground { code: i32 },
    OpenedTab,
    Stopped { pid: i32, signal: Signal },
    AlreadyStopped { stale_pid: Option<i32> },
    Reloaded { pid: i32 },
    Status { pid: i32, tree: ProcessTree },
    Failed(SupervisorError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        match self {
            Outcome::Failed(_) => false,
            Outcome::Foreground { code } => *code == 0 || *code == crate::supervisor::SIGINT_EXIT_CODE,
            _ => true,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Started { pid } => write!(f, "started (pid {})", pid),
            Outcome::AlreadyRunning { pid } => write!(f, "already running (pid {})", pid),
            Outcome::Foreground { code } => write!(f, "exited with code {}", code),
            Outcome::OpenedTab => write!(f, "opened in a tmux window"),
            Outcome::Stopped { pid, signal } => write!(f, "sent {} to pid {}", signal, pid),
            Outcome::AlreadyStopped { stale_pid: None } => write!(f, "already stopped"),
            Outcome::AlreadyStopped { stale_pid: Some(pid) } => {
                write!(f, "already stopped (stale pid {})", pid)
            }
            Outcome::Reloaded { pid } => write!(f, "reloading (sent SIGHUP to pid {})", pid),
            Outcome::Status { pid, tree } => {
                write!(
                    f,
                    "running (pid {}, {} processes, {})",
                    pid,
                    tree.len(),
                    format_megabytes(tree.total_rss())
                )?;
                for line in tree.render() {
                    write!(f, "\n  {}", line)?;
                }
                Ok(())
            }
            Outcome::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

#[derive(Debug)]
pub struct ContextReport {
    pub context: String,
    pub outcome: Outcome,
}

impl fmt::Display for ContextReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.outcome)
    }
}

pub fn all_succeeded(reports: &[ContextReport]) -> bool {
    reports.iter().all(|report| report.outcome.is_success())
}

/// Looks up the named contexts; an empty list means every known context.
/// A context that failed to load is reported under its own name.
pub fn resolve_contexts(settings: &Settings, names: &[String]) -> Result<Vec<(String, Result<Context>)>> {
    let mut known = settings.discover_contexts()?;
    if names.is_empty() {
        return Ok(known.into_iter().collect());
    }

    Ok(names
        .iter()
        .map(|name| {
            let context = known
                .remove(name)
                .unwrap_or_else(|| Err(SupervisorError::UnknownContext(name.clone())));
            (name.clone(), context)
        })
        .collect())
}

pub struct ContextController<P: ProcessControl> {
    control: P,
}

impl<P: ProcessControl> ContextController<P> {
    pub fn new(control: P) -> Self {
        Self { control }
    }

    pub fn start(&self, context: &Context) -> Outcome {
        let pid_file = PidFile::new(&context.pid_file);
        match pid_file.read() {
            Err(err) => return Outcome::Failed(err),
            Ok(Some(pid)) if self.control.is_alive(pid) => return Outcome::AlreadyRunning { pid },
            Ok(_) => {}
        }

        let pid = match self.control.spawn_detached(context) {
            Ok(pid) => pid,
            Err(err) => return Outcome::Failed(err),
        };
        match pid_file.write(pid) {
            Ok(()) => Outcome::Started { pid },
            Err(err) => Outcome::Failed(err),
        }
    }

    /// A single context runs in the foreground; several each get a tmux
    /// window.
    pub fn start_debug(&self, contexts: &[Context]) -> Vec<ContextReport> {
        if let [context] = contexts {
            let outcome = match self.control.run_foreground(context) {
                Ok(code) => Outcome::Foreground { code },
                Err(err) => Outcome::Failed(err),
            };
            return vec![ContextReport {
                context: context.name.clone(),
                outcome,
            }];
        }

        contexts
            .iter()
            .map(|context| ContextReport {
                context: context.name.clone(),
                outcome: match self.control.open_tab(context) {
                    Ok(()) => Outcome::OpenedTab,
                    Err(err) => Outcome::Failed(err),
                },
            })
            .collect()
    }

    pub fn stop(&self, context: &Context, force: bool) -> Outcome {
        let pid = match PidFile::new(&context.pid_file).read() {
            Err(err) => return Outcome::Failed(err),
            Ok(None) => return Outcome::AlreadyStopped { stale_pid: None },
            Ok(Some(pid)) if !self.control.is_alive(pid) => {
                return Outcome::AlreadyStopped {
                    stale_pid: Some(pid),
                }
            }
            Ok(Some(pid)) => pid,
        };

        let signal = if force { Signal::SIGKILL } else { Signal::SIGINT };
        match self.control.signal(pid, signal) {
            Ok(()) => Outcome::Stopped { pid, signal },
            Err(err) => Outcome::Failed(err),
        }
    }

    pub fn reload(&self, context: &Context) -> Outcome {
        let pid = match self.live_pid(context) {
            Ok(pid) => pid,
            Err(err) => return Outcome::Failed(err),
        };
        match self.control.signal(pid, Signal::SIGHUP) {
            Ok(()) => Outcome::Reloaded { pid },
            Err(err) => Outcome::Failed(err),
        }
    }

    pub fn status(&self, context: &Context) -> Outcome {
        let pid = match self.live_pid(context) {
            Ok(pid) => pid,
            Err(err) => return Outcome::Failed(err),
        };
        match self.control.inspect(pid) {
            Ok(tree) => Outcome::Status { pid, tree },
            Err(err) => Outcome::Failed(err),
        }
    }

    /// Applies `command` to every target and reports each one.
    pub fn run(&self, command: Command, targets: Vec<(String, Result<Context>)>) -> Vec<ContextReport> {
        let mut reports = Vec::new();
        let mut contexts = Vec::new();

        for (name, context) in targets {
            match context {
                Ok(context) => contexts.push(context),
                Err(err) => reports.push(ContextReport {
                    context: name,
                    outcome: Outcome::Failed(err),
                }),
            }
        }

        if let Command::Start { debug: true } = command {
            reports.extend(self.start_debug(&contexts));
            return reports;
        }

        for context in &contexts {
            let outcome = match command {
                Command::Start { .. } => self.start(context),
                Command::Stop { force } => self.stop(context, force),
                Command::Reload => self.reload(context),
                Command::Status => self.status(context),
            };
            reports.push(ContextReport {
                context: context.name.clone(),
                outcome,
            });
        }
        reports
    }

    fn live_pid(&self, context: &Context) -> Result<i32> {
        match PidFile::new(&context.pid_file).read()? {
            None => Err(SupervisorError::MissingPidFile(context.pid_file.clone())),
            Some(pid) if !self.control.is_alive(pid) => Err(SupervisorError::StalePidFile {
                path: context.pid_file.clone(),
                pid,
            }),
            Some(pid) => Ok(pid),
        }
    }
}
