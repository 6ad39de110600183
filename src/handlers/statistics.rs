use std::sync::Arc;

use serde_json::json;

use crate::{
    ipc::{bind, IpcMessage, MethodList, Responder},
    ledger::{self, SharedLedger},
};

pub const CRASHES_METHOD: &str = "statistics.crashes";
pub const WORKERS_METHOD: &str = "statistics.workers";
pub const SUMMARY_METHOD: &str = "statistics.summary";

/// Read-only views over the crash ledger and worker table.
pub struct Statistics {
    ledger: SharedLedger,
}

impl Statistics {
    fn crashes(&self, _message: &IpcMessage, responder: Responder) {
        let crashes = ledger::lock(&self.ledger).crashes().to_vec();
        match serde_json::to_value(crashes) {
            Ok(value) => responder.ok(value),
            Err(err) => responder.err(err),
        }
    }

    fn workers(&self, _message: &IpcMessage, responder: Responder) {
        let workers = ledger::lock(&self.ledger).workers();
        responder.ok(json!(workers));
    }

    fn summary(&self, _message: &IpcMessage, responder: Responder) {
        let summary = ledger::lock(&self.ledger).summary();
        match serde_json::to_value(summary) {
            Ok(value) => responder.ok(value),
            Err(err) => responder.err(err),
        }
    }
}

pub fn methods(ledger: SharedLedger) -> MethodList {
    let statistics = Arc::new(Statistics { ledger });
    vec![
        (CRASHES_METHOD, bind(statistics.clone(), Statistics::crashes)),
        (WORKERS_METHOD, bind(statistics.clone(), Statistics::workers)),
        (SUMMARY_METHOD, bind(statistics, Statistics::summary)),
    ]
}
