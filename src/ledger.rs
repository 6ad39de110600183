use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};

use crate::timestamp::current_timestamp;

/// One abnormal worker exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub timestamp: u64,
    pub pid: i32,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub workers: usize,
    pub crashes: usize,
    pub restarts: u64,
    pub uptime_secs: u64,
}

/// Master-owned crash and statistics record. Lives as long as the master
/// process and is never persisted.
#[derive(Debug)]
pub struct Ledger {
    crashes: Vec<CrashRecord>,
    counters: BTreeMap<String, i64>,
    workers: BTreeSet<i32>,
    restarts: u64,
    started_at: u64,
}

pub type SharedLedger = Arc<Mutex<Ledger>>;

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            crashes: Vec::new(),
            counters: BTreeMap::new(),
            workers: BTreeSet::new(),
            restarts: 0,
            started_at: current_timestamp(),
        }
    }

    pub fn shared() -> SharedLedger {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn record_crash(&mut self, pid: i32, exit_code: Option<i32>, signal: Option<i32>) {
        self.crashes.push(CrashRecord {
            timestamp: current_timestamp(),
            pid,
            exit_code,
            signal,
        });
    }

    pub fn crashes(&self) -> &[CrashRecord] {
        &self.crashes
    }

    /// Number of crashes no older than `window_secs` relative to `now`.
    pub fn recent_crashes(&self, window_secs: u64, now: u64) -> usize {
        self.crashes
            .iter()
            .rev()
            .take_while(|crash| now.saturating_sub(crash.timestamp) <= window_secs)
            .count()
    }

    /// Counters saturate at the `i64` bounds.
    pub fn increment(&mut self, name: &str, by: i64) -> i64 {
        let counter = self.counters.entry(name.to_owned()).or_insert(0);
        *counter = counter.saturating_add(by);
        *counter
    }

    pub fn counter(&self, name: &str) -> i64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> &BTreeMap<String, i64> {
        &self.counters
    }

    pub fn worker_started(&mut self, pid: i32) {
        self.workers.insert(pid);
    }

    pub fn worker_exited(&mut self, pid: i32) {
        self.workers.remove(&pid);
    }

    pub fn workers(&self) -> Vec<i32> {
        self.workers.iter().copied().collect()
    }

    pub fn record_restart(&mut self) {
        self.restarts += 1;
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            workers: self.workers.len(),
            crashes: self.crashes.len(),
            restarts: self.restarts,
            uptime_secs: current_timestamp().saturating_sub(self.started_at),
        }
    }
}

/// Locks the ledger, recovering the data from a poisoned lock.
pub fn lock(ledger: &SharedLedger) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
