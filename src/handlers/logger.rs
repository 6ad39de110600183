use std::sync::Arc;

use serde_json::Value;

use crate::{
    ipc::{bind, IpcMessage, MethodList, Responder},
    logger::{LogLevel, Logger},
};

pub const LOG_METHOD: &str = "logger.log";

/// Writes worker log records into the master's log stream.
pub struct LogForwarder {
    logger: Logger,
}

impl LogForwarder {
    fn log(&self, message: &IpcMessage, responder: Responder) {
        let level = message
            .args
            .get("level")
            .and_then(Value::as_str)
            .and_then(|level| level.parse().ok())
            .unwrap_or(LogLevel::Info);
        let text = match message.args.get("message") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => return,
        };

        self.logger
            .with_prefix(format!("worker {}", responder.pid()))
            .log(level, &text);
    }
}

pub fn methods(logger: Logger) -> MethodList {
    let forwarder = Arc::new(LogForwarder { logger });
    vec![(LOG_METHOD, bind(forwarder, LogForwarder::log))]
}
