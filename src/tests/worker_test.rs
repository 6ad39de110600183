#[cfg(test)]
mod tests {
    use crate::error::SupervisorError;
    use crate::handlers;
    use crate::handlers::logger::LOG_METHOD;
    use crate::ipc::{IpcMessage, MasterChannel, SHUTDOWN_METHOD};
    use crate::ledger::{self, Ledger};
    use crate::log;
    use crate::logger::{LogLevel, Logger, MemorySink};
    use crate::socket_communication::receive_message;
    use crate::worker::WorkerRuntime;

    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::UnixStream;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_runtime_forwards_logs_and_metrics() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::new(LogLevel::Debug, sink.clone());
        let ledger = Ledger::shared();
        let master = MasterChannel::with_pid(
            1,
            handlers::builtin_registry(&logger, &ledger).unwrap(),
            logger,
        );

        let (master_end, worker_end) = UnixStream::pair().unwrap();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        master.add_process(100, master_end, inbound_tx);
        let dispatcher = master.clone();
        tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                dispatcher.dispatch(inbound);
            }
        });

        let runtime = WorkerRuntime::from_stream(worker_end, 100, "web", false, LogLevel::Info)
            .expect("Failed to start worker runtime");
        assert_eq!(runtime.context(), "web");
        assert!(!runtime.debug());

        log!(runtime.logger(), LogLevel::Info, "listening on {}", "127.0.0.1:8080");
        log!(runtime.logger(), LogLevel::Debug, "filtered out");
        runtime.increment("requests").unwrap();
        runtime.channel().flush().await.unwrap();

        timeout(Duration::from_secs(5), async {
            while ledger::lock(&ledger).counter("requests") != 1 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("metric never arrived");
        assert!(sink.contains(LogLevel::Info, "[worker 100] listening on 127.0.0.1:8080"));
        assert!(!sink.contains(LogLevel::Debug, "filtered out"));

        assert!(!runtime.is_shutdown_requested());
        master.broadcast(SHUTDOWN_METHOD, json!({"reason": "shutdown"}));
        timeout(Duration::from_secs(5), runtime.shutdown_requested())
            .await
            .expect("shutdown broadcast not observed");
        assert!(runtime.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_lost_master_requests_shutdown() {
        let (worker_end, master_end) = UnixStream::pair().unwrap();
        let runtime = WorkerRuntime::from_stream(worker_end, 100, "web", true, LogLevel::Debug).unwrap();

        drop(master_end);
        timeout(Duration::from_secs(5), runtime.shutdown_requested())
            .await
            .expect("closed pipe not observed");

        // Falls back to stderr instead of failing.
        log!(runtime.logger(), LogLevel::Warn, "master is gone");
        assert!(runtime.channel().is_closed());
    }

    #[tokio::test]
    async fn test_close_completes_before_exit() {
        let (worker_end, mut master_end) = UnixStream::pair().unwrap();
        let runtime = WorkerRuntime::from_stream(worker_end, 100, "web", false, LogLevel::Info).unwrap();
        let logger = runtime.logger().clone();
        let steps = Arc::new(Mutex::new(Vec::new()));

        let closing = steps.clone();
        runtime
            .close_after(async move {
                sleep(Duration::from_millis(50)).await;
                log!(logger, LogLevel::Info, "listener closed");
                closing.lock().unwrap().push("closed");
            })
            .await;
        steps.lock().unwrap().push("exit");

        assert_eq!(*steps.lock().unwrap(), vec!["closed", "exit"]);
        // The record logged while closing was already written when the worker
        // became ready to exit.
        let record: IpcMessage = timeout(Duration::from_millis(100), receive_message::<_, IpcMessage>(&mut master_end))
            .await
            .expect("record not flushed before exit")
            .unwrap()
            .unwrap();
        assert_eq!(record.method, LOG_METHOD);
        assert_eq!(record.args["message"], "listener closed");
    }

    #[test]
    fn test_connect_requires_inherited_pipe() {
        std::env::remove_var(crate::ipc::IPC_FD_ENV);
        let result = WorkerRuntime::connect("web", false, LogLevel::Info);
        assert!(matches!(result, Err(SupervisorError::Config(_))));
    }
}
