//! Built-in IPC methods the master answers for its workers.
//!
//! Each module exports a static `(name, handler)` list; the supervisor
//! registers all of them at startup.

pub mod logger;
pub mod metrics;
pub mod statistics;

use crate::{
    error::Result,
    ipc::{MethodList, MethodRegistry},
    ledger::SharedLedger,
    logger::Logger,
};

/// Every built-in method bound to the master's logger and ledger.
pub fn builtin_methods(logger: &Logger, ledger: &SharedLedger) -> MethodList {
    let mut methods = logger::methods(logger.clone());
    methods.extend(metrics::methods(ledger.clone()));
    methods.extend(statistics::methods(ledger.clone()));
    methods
}

/// A registry preloaded with [`builtin_methods`].
pub fn builtin_registry(logger: &Logger, ledger: &SharedLedger) -> Result<MethodRegistry> {
    let mut registry = MethodRegistry::new();
    registry.extend(builtin_methods(logger, ledger))?;
    Ok(registry)
}
