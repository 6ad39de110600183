use std::sync::Arc;

use serde_json::{json, Value};

use crate::{
    ipc::{bind, IpcMessage, MethodList, Responder},
    ledger::{self, SharedLedger},
};

pub const INCREMENT_METHOD: &str = "metrics.increment";
pub const SNAPSHOT_METHOD: &str = "metrics.snapshot";

pub struct Metrics {
    ledger: SharedLedger,
}

impl Metrics {
    /// `{ "name": "requests", "by": 1 }` -> new counter value.
    fn increment(&self, message: &IpcMessage, responder: Responder) {
        let Some(name) = message.args.get("name").and_then(Value::as_str) else {
            responder.err("metrics.increment requires a string `name`");
            return;
        };
        let by = message.args.get("by").and_then(Value::as_i64).unwrap_or(1);

        let value = ledger::lock(&self.ledger).increment(name, by);
        responder.ok(json!(value));
    }

    fn snapshot(&self, _message: &IpcMessage, responder: Responder) {
        let counters = ledger::lock(&self.ledger).counters().clone();
        responder.ok(json!(counters));
    }
}

pub fn methods(ledger: SharedLedger) -> MethodList {
    let metrics = Arc::new(Metrics { ledger });
    vec![
        (INCREMENT_METHOD, bind(metrics.clone(), Metrics::increment)),
        (SNAPSHOT_METHOD, bind(metrics, Metrics::snapshot)),
    ]
}
