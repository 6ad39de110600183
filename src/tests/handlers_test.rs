#[cfg(test)]
mod tests {
    use crate::handlers::{
        self,
        logger::LOG_METHOD,
        metrics::{INCREMENT_METHOD, SNAPSHOT_METHOD},
        statistics::{CRASHES_METHOD, SUMMARY_METHOD, WORKERS_METHOD},
    };
    use crate::ipc::{MasterChannel, WorkerChannel};
    use crate::ledger::{self, Ledger, SharedLedger};
    use crate::logger::{LogLevel, Logger, MemorySink};

    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::UnixStream;
    use tokio::sync::mpsc;

    const WORKER_PID: i32 = 100;

    fn setup() -> (WorkerChannel, SharedLedger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::new(LogLevel::Debug, sink.clone());
        let ledger = Ledger::shared();
        let registry = handlers::builtin_registry(&logger, &ledger).expect("valid method names");
        let master = MasterChannel::with_pid(1, registry, logger);

        let (master_end, worker_end) = UnixStream::pair().unwrap();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        master.add_process(WORKER_PID, master_end, inbound_tx);
        tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                master.dispatch(inbound);
            }
        });

        (WorkerChannel::open(worker_end, WORKER_PID), ledger, sink)
    }

    #[test]
    fn test_builtin_method_names() {
        let logger = Logger::new(LogLevel::Info, Arc::new(MemorySink::default()));
        let registry = handlers::builtin_registry(&logger, &Ledger::shared()).unwrap();
        assert_eq!(
            registry.names(),
            vec![
                "logger.log",
                "metrics.increment",
                "metrics.snapshot",
                "statistics.crashes",
                "statistics.summary",
                "statistics.workers",
            ]
        );
    }

    #[tokio::test]
    async fn test_metrics() {
        let (worker, ledger, _sink) = setup();

        let value = worker
            .call(INCREMENT_METHOD, json!({"name": "requests"}))
            .await
            .unwrap();
        assert_eq!(value, json!(1));
        let value = worker
            .call(INCREMENT_METHOD, json!({"name": "requests", "by": 9}))
            .await
            .unwrap();
        assert_eq!(value, json!(10));

        assert!(worker.call(INCREMENT_METHOD, json!({"by": 2})).await.is_err());

        let snapshot = worker.call(SNAPSHOT_METHOD, json!({})).await.unwrap();
        assert_eq!(snapshot, json!({"requests": 10}));
        assert_eq!(ledger::lock(&ledger).counter("requests"), 10);
    }

    #[tokio::test]
    async fn test_metrics_overflow_keeps_master_alive() {
        let (worker, ledger, _sink) = setup();

        let value = worker
            .call(INCREMENT_METHOD, json!({"name": "x", "by": i64::MAX}))
            .await
            .unwrap();
        assert_eq!(value, json!(i64::MAX));
        let value = worker
            .call(INCREMENT_METHOD, json!({"name": "x", "by": 1}))
            .await
            .unwrap();
        assert_eq!(value, json!(i64::MAX));

        // The dispatcher survived and still answers.
        let snapshot = worker.call(SNAPSHOT_METHOD, json!({})).await.unwrap();
        assert_eq!(snapshot, json!({"x": i64::MAX}));
        assert_eq!(ledger::lock(&ledger).counter("x"), i64::MAX);
    }

    #[tokio::test]
    async fn test_statistics() {
        let (worker, ledger, _sink) = setup();
        {
            let mut ledger = ledger::lock(&ledger);
            ledger.worker_started(WORKER_PID);
            ledger.record_crash(77, Some(1), None);
        }

        let crashes = worker.call(CRASHES_METHOD, json!({})).await.unwrap();
        assert_eq!(crashes[0]["pid"], 77);
        assert_eq!(crashes[0]["exit_code"], 1);

        let workers = worker.call(WORKERS_METHOD, json!({})).await.unwrap();
        assert_eq!(workers, json!([WORKER_PID]));

        let summary = worker.call(SUMMARY_METHOD, json!({})).await.unwrap();
        assert_eq!(summary["crashes"], 1);
        assert_eq!(summary["workers"], 1);
    }

    #[tokio::test]
    async fn test_worker_logs_reach_master() {
        let (worker, _ledger, sink) = setup();

        worker
            .notify(LOG_METHOD, json!({"level": "warn", "message": "disk almost full"}))
            .unwrap();
        // A round trip behind the notification guarantees it was dispatched.
        worker.call(SNAPSHOT_METHOD, json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(sink.contains(LogLevel::Warn, "[worker 100] disk almost full"));
    }
}
