#[cfg(test)]
mod tests {
    use crate::error::SupervisorError;
    use crate::ipc::{
        InboundMessage, IpcMessage, MasterChannel, MethodRegistry, WorkerChannel, SHUTDOWN_METHOD,
    };
    use crate::logger::{LogLevel, Logger, MemorySink};
    use crate::socket_communication::{send_message, MAX_FRAME_LEN};

    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::timeout;

    const MASTER_PID: i32 = 1;
    const WORKER_PID: i32 = 100;

    fn registry() -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        registry
            .add_method("echo.args", |message: &IpcMessage, responder| {
                responder.ok(message.args.clone())
            })
            .unwrap();
        registry
            .add_method("math.double", |message: &IpcMessage, responder| {
                let n = message.args.get("n").and_then(Value::as_i64).unwrap_or(0);
                responder.ok(json!(n * 2))
            })
            .unwrap();
        registry
            .add_method("always.fails", |_: &IpcMessage, responder| {
                responder.err("nope")
            })
            .unwrap();
        registry
    }

    /// A master with one registered worker pipe and a task dispatching its
    /// inbound frames.
    fn setup(worker_pid: i32) -> (MasterChannel, WorkerChannel, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::new(LogLevel::Trace, sink.clone());
        let master = MasterChannel::with_pid(MASTER_PID, registry(), logger);

        let (master_end, worker_end) = UnixStream::pair().expect("Failed to create UnixStream pair");
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
        master.add_process(WORKER_PID, master_end, inbound_tx);

        let dispatcher = master.clone();
        tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                dispatcher.dispatch(inbound);
            }
        });

        (master, WorkerChannel::open(worker_end, worker_pid), sink)
    }

    #[tokio::test]
    async fn test_request_callback_receives_result() {
        let (_master, worker, _sink) = setup(WORKER_PID);

        let (tx, rx) = oneshot::channel();
        worker
            .request("echo.args", json!({"hello": "world"}), move |error, result, raw| {
                let _ = tx.send((error, result, raw.res_pid));
            })
            .unwrap();

        let (error, result, res_pid) = timeout(Duration::from_secs(5), rx)
            .await
            .expect("no response")
            .unwrap();
        assert_eq!(error, None);
        assert_eq!(result, Some(json!({"hello": "world"})));
        assert_eq!(res_pid, Some(MASTER_PID));
    }

    #[tokio::test]
    async fn test_handler_error_is_remote() {
        let (_master, worker, _sink) = setup(WORKER_PID);

        let result = timeout(Duration::from_secs(5), worker.call("always.fails", json!({})))
            .await
            .expect("no response");
        assert!(matches!(result, Err(SupervisorError::Remote(ref e)) if e == "nope"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_do_not_clobber() {
        let (_master, worker, _sink) = setup(WORKER_PID);

        let (a, b, c) = tokio::join!(
            worker.call("math.double", json!({"n": 1})),
            worker.call("math.double", json!({"n": 20})),
            worker.call("math.double", json!({"n": 300})),
        );
        assert_eq!(a.unwrap(), json!(2));
        assert_eq!(b.unwrap(), json!(40));
        assert_eq!(c.unwrap(), json!(600));
    }

    #[tokio::test]
    async fn test_unregistered_method_is_dropped() {
        let (master, worker, sink) = setup(WORKER_PID);

        let result = timeout(Duration::from_millis(300), worker.call("no.such", json!({}))).await;
        assert!(result.is_err(), "an unregistered method gets no response");
        assert!(sink.contains(LogLevel::Warn, "no.such"));

        // The pipe is still usable afterwards.
        assert_eq!(worker.call("math.double", json!({"n": 2})).await.unwrap(), json!(4));
        assert!(master.contains(WORKER_PID));
    }

    #[tokio::test]
    async fn test_request_pid_is_taken_from_the_pipe() {
        // The worker claims a pid the master never registered.
        let (_master, worker, _sink) = setup(555);

        let value = timeout(Duration::from_secs(5), worker.call("echo.args", json!(1)))
            .await
            .expect("no response")
            .unwrap();
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_listener_and_skips_dead_peer() {
        let (master, worker, _sink) = setup(WORKER_PID);

        let (dead_master_end, dead_worker_end) = UnixStream::pair().unwrap();
        drop(dead_worker_end);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        master.add_process(200, dead_master_end, inbound_tx);

        let (tx, mut rx) = mpsc::unbounded_channel();
        worker
            .add_broadcast_listener(SHUTDOWN_METHOD, move |message| {
                let _ = tx.send(message.args.clone());
            })
            .unwrap();

        master.broadcast(SHUTDOWN_METHOD, json!({"reason": "reboot"}));

        let args = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("broadcast not delivered")
            .unwrap();
        assert_eq!(args, json!({"reason": "reboot"}));
        assert_eq!(master.peers(), vec![WORKER_PID, 200]);
    }

    #[tokio::test]
    async fn test_master_call_answered_by_worker() {
        let (master, worker, _sink) = setup(WORKER_PID);

        let responder = worker.clone();
        worker
            .add_broadcast_listener("health.ping", move |message| {
                let _ = responder.respond(message, None, Some(json!({"pid": WORKER_PID})));
            })
            .unwrap();

        let value = timeout(
            Duration::from_secs(5),
            master.call(WORKER_PID, "health.ping", json!({})),
        )
        .await
        .expect("no response")
        .unwrap();
        assert_eq!(value, json!({"pid": WORKER_PID}));
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let (master, _worker, _sink) = setup(WORKER_PID);

        let result = master.request(999, "anything", json!({}));
        assert!(matches!(result, Err(SupervisorError::UnknownPeer(999))));

        assert!(master.remove_process(WORKER_PID));
        assert!(!master.remove_process(WORKER_PID));
        assert!(matches!(
            master.request(WORKER_PID, "anything", json!({})),
            Err(SupervisorError::UnknownPeer(WORKER_PID))
        ));
    }

    #[tokio::test]
    async fn test_invalid_method_names() {
        let (master, worker, _sink) = setup(WORKER_PID);

        assert!(worker.add_broadcast_listener("bad name", |_| {}).is_err());
        assert!(worker.add_broadcast_listener("", |_| {}).is_err());
        assert!(master
            .add_method("9lives", |_: &IpcMessage, responder| responder.ok(json!(null)))
            .is_err());
        assert!(master
            .add_method("statistics.extra_1", |_: &IpcMessage, responder| responder.ok(json!(null)))
            .is_ok());
        assert!(master.has_method("statistics.extra_1"));
    }

    #[tokio::test]
    async fn test_closed_pipe_fails_pending_calls() {
        let (worker_end, master_end) = UnixStream::pair().unwrap();
        let worker = WorkerChannel::open(worker_end, WORKER_PID);

        let pending = worker.call("echo.args", json!({}));
        drop(master_end);

        let result = timeout(Duration::from_secs(5), pending).await.expect("call hung");
        assert!(matches!(result, Err(SupervisorError::ChannelClosed)));

        timeout(Duration::from_secs(5), worker.closed())
            .await
            .expect("close not observed");
        assert!(worker.is_closed());
    }

    #[tokio::test]
    async fn test_wire_field_names() {
        let message = IpcMessage::request(5, 9, "logger.log", json!({"level": "info"}))
            .into_response(1, Some("boom".into()), None);
        let raw = serde_json::to_value(&message).unwrap();

        assert_eq!(raw["type"], "response");
        assert_eq!(raw["reqPid"], 9);
        assert_eq!(raw["resPid"], 1);
        assert_eq!(raw["error"], "boom");
        assert!(raw.get("result").is_none());
    }

    fn oversized_args() -> Value {
        json!({ "blob": "x".repeat(MAX_FRAME_LEN + 1) })
    }

    #[tokio::test]
    async fn test_oversized_worker_frame_keeps_pipe_open() {
        let (_master, worker, _sink) = setup(WORKER_PID);

        worker.notify("echo.args", oversized_args()).unwrap();
        let result = timeout(Duration::from_secs(5), worker.call("echo.args", oversized_args()))
            .await
            .expect("oversized call hung");
        assert!(matches!(result, Err(SupervisorError::Remote(ref e)) if e.contains("frame limit")));

        let value = timeout(Duration::from_secs(5), worker.call("echo.args", json!({"n": 1})))
            .await
            .expect("no response")
            .unwrap();
        assert_eq!(value, json!({"n": 1}));
        assert!(!worker.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_master_frame_keeps_pipe_open() {
        let (master, worker, sink) = setup(WORKER_PID);

        let (tx, mut rx) = mpsc::unbounded_channel();
        worker
            .add_broadcast_listener(SHUTDOWN_METHOD, move |message| {
                let _ = tx.send(message.args.clone());
            })
            .unwrap();

        let result = timeout(
            Duration::from_secs(5),
            master.call(WORKER_PID, "health.ping", oversized_args()),
        )
        .await
        .expect("oversized call hung");
        assert!(matches!(result, Err(SupervisorError::FrameTooLarge(_))));

        master.broadcast(SHUTDOWN_METHOD, json!({"reason": "stop"}));
        let args = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("broadcast not delivered")
            .unwrap();
        assert_eq!(args, json!({"reason": "stop"}));
        assert!(sink.contains(LogLevel::Warn, "health.ping"));
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::new(LogLevel::Trace, sink.clone());
        let master = MasterChannel::with_pid(MASTER_PID, registry(), logger);

        let (master_end, mut raw) = UnixStream::pair().unwrap();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
        master.add_process(WORKER_PID, master_end, inbound_tx);

        raw.write_all(&3u32.to_be_bytes()).await.unwrap();
        raw.write_all(b"abc").await.unwrap();
        let request = IpcMessage::request(4, WORKER_PID, "echo.args", json!({}));
        send_message(&mut raw, &request).await.unwrap();

        let inbound = timeout(Duration::from_secs(5), inbound_rx.recv())
            .await
            .expect("pipe dropped after a bad frame")
            .unwrap();
        assert_eq!(inbound.pid, WORKER_PID);
        assert_eq!(inbound.message.id, 4);
        assert!(sink.contains(LogLevel::Warn, "Skipping frame"));
    }

    #[tokio::test]
    async fn test_removing_worker_fails_its_calls() {
        let (master, worker, _sink) = setup(WORKER_PID);

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        worker
            .add_broadcast_listener("health.ping", move |message| {
                let _ = seen_tx.send(message.id);
            })
            .unwrap();

        let caller = master.clone();
        let call = tokio::spawn(async move { caller.call(WORKER_PID, "health.ping", json!({})).await });

        timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("request not delivered")
            .unwrap();
        assert!(master.remove_process(WORKER_PID));

        let result = timeout(Duration::from_secs(5), call)
            .await
            .expect("call hung after its worker went away")
            .unwrap();
        assert!(matches!(result, Err(SupervisorError::ChannelClosed)));
    }
}
