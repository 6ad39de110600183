// resource_monitor.rs

use gethostname::gethostname;
use sysinfo::System;

use crate::error::{Result, SupervisorError};

/// One row of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: i32,
    pub ppid: i32,
    pub command: String,
    pub rss_bytes: u64,
}

/// A master process and its direct children with their resident memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTree {
    pub root: ProcessEntry,
    pub children: Vec<ProcessEntry>,
}

impl ProcessTree {
    /// Picks `root` and every entry whose parent is `root` out of a process
    /// table. `None` when `root` is not in the table.
    pub fn from_entries(root: i32, entries: &[ProcessEntry]) -> Option<Self> {
        let root_entry = entries.iter().find(|entry| entry.pid == root)?.clone();
        let mut children: Vec<ProcessEntry> = entries
            .iter()
            .filter(|entry| entry.ppid == root && entry.pid != root)
            .cloned()
            .collect();
        children.sort_by_key(|entry| entry.pid);

        Some(Self {
            root: root_entry,
            children,
        })
    }

    /// Reads the live process table from `/proc`.
    #[cfg(target_os = "linux")]
    pub fn collect(root: i32) -> Result<Self> {
        let page_size = page_size();
        let mut entries = Vec::new();

        for process in procfs::process::all_processes()? {
            // Processes may vanish while the table is walked.
            let Ok(process) = process else { continue };
            let Ok(stat) = process.stat() else { continue };
            if stat.pid != root && stat.ppid != root {
                continue;
            }
            let rss_bytes = process
                .statm()
                .map(|statm| statm.resident * page_size)
                .unwrap_or(0);
            entries.push(ProcessEntry {
                pid: stat.pid,
                ppid: stat.ppid,
                command: stat.comm.clone(),
                rss_bytes,
            });
        }

        Self::from_entries(root, &entries)
            .ok_or_else(|| SupervisorError::Procfs(format!("process {} not found", root)))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn collect(root: i32) -> Result<Self> {
        Err(SupervisorError::Procfs(format!(
            "process introspection of {} needs /proc",
            root
        )))
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessEntry> {
        std::iter::once(&self.root).chain(self.children.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.children.len()
    }

    pub fn total_rss(&self) -> u64 {
        self.processes().map(|entry| entry.rss_bytes).sum()
    }

    /// One line per process followed by the aggregate.
    pub fn render(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .processes()
            .map(|entry| {
                let role = if entry.pid == self.root.pid { "master" } else { "worker" };
                format!(
                    "{:<8} {:>8}  {:<16} {:>10}",
                    role,
                    entry.pid,
                    entry.command,
                    format_megabytes(entry.rss_bytes)
                )
            })
            .collect();
        lines.push(format!(
            "{:<8} {:>8}  {:<16} {:>10}",
            "total",
            self.len(),
            "",
            format_megabytes(self.total_rss())
        ));
        lines
    }
}

pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Host-wide numbers shown above a status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSummary {
    pub hostname: String,
    pub total_memory: u64,
    pub used_memory: u64,
}

impl HostSummary {
    pub fn collect() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            hostname: gethostname().to_string_lossy().into_owned(),
            total_memory: system.total_memory(),
            used_memory: system.used_memory(),
        }
    }

    /// Share of host memory used by `bytes`, in percent.
    pub fn share_of(&self, bytes: u64) -> f64 {
        if self.total_memory == 0 {
            return 0.0;
        }
        bytes as f64 / self.total_memory as f64 * 100.0
    }
}
