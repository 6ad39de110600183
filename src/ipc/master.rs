use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};

use serde_json::Value;
use tokio::{
    net::UnixStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    error::{Result, SupervisorError},
    ipc::{
        message::IpcMessage,
        registry::{MethodFn, MethodRegistry},
    },
    log,
    logger::{LogLevel, Logger},
    socket_communication::{receive_message, send_message},
};

/// A frame read from a worker, tagged with the pid of the pipe it came from.
#[derive(Debug)]
pub struct InboundMessage {
    pub pid: i32,
    pub message: IpcMessage,
}

struct Peer {
    outbound: mpsc::UnboundedSender<IpcMessage>,
    reader: JoinHandle<()>,
}

// A `call` waiting on one worker.
struct Pending {
    pid: i32,
    waiter: oneshot::Sender<Result<IpcMessage>>,
}

struct Shared {
    pid: i32,
    peers: Mutex<HashMap<i32, Peer>>,
    registry: RwLock<MethodRegistry>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    logger: Logger,
}

/// Master side of the IPC channel, aware of the whole worker pool.
#[derive(Clone)]
pub struct MasterChannel {
    shared: Arc<Shared>,
}

impl MasterChannel {
    pub fn new(registry: MethodRegistry, logger: Logger) -> Self {
        Self::with_pid(std::process::id() as i32, registry, logger)
    }

    pub fn with_pid(pid: i32, registry: MethodRegistry, logger: Logger) -> Self {
        Self {
            shared: Arc::new(Shared {
                pid,
                peers: Mutex::new(HashMap::new()),
                registry: RwLock::new(registry),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                logger,
            }),
        }
    }

    pub fn pid(&self) -> i32 {
        self.shared.pid
    }

    pub fn logger(&self) -> &Logger {
        &self.shared.logger
    }

    /// Registers a worker's end of the pipe. Frames it sends are forwarded to
    /// `inbound` until the pipe closes.
    pub fn add_process(
        &self,
        pid: i32,
        stream: UnixStream,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<IpcMessage>();

        let logger = self.shared.logger.clone();
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match send_message(&mut write_half, &message).await {
                    Ok(()) => {}
                    Err(err) if err.is_frame_error() => {
                        log!(
                            logger,
                            LogLevel::Warn,
                            "Frame {} to worker {} not sent: {}",
                            message.method,
                            pid,
                            err
                        );
                        fail_call(&shared, &message, err);
                    }
                    Err(err) => {
                        log!(logger, LogLevel::Debug, "Write to worker {} failed: {}", pid, err);
                        break;
                    }
                }
            }
        });

        let logger = self.shared.logger.clone();
        let reader = tokio::spawn(async move {
            loop {
                match receive_message::<_, IpcMessage>(&mut read_half).await {
                    Ok(Some(message)) => {
                        if inbound.send(InboundMessage { pid, message }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) if err.is_frame_error() => {
                        log!(logger, LogLevel::Warn, "Skipping frame from worker {}: {}", pid, err);
                    }
                    Err(err) => {
                        log!(logger, LogLevel::Warn, "Dropping pipe of worker {}: {}", pid, err);
                        break;
                    }
                }
            }
        });

        let previous = self
            .lock_peers()
            .insert(pid, Peer { outbound, reader });
        if let Some(previous) = previous {
            previous.reader.abort();
        }
    }

    /// Drops a worker's registration. Unknown pids are ignored.
    ///
    /// The reader keeps draining frames the worker wrote before it exited;
    /// it stops on its own at end of stream. Calls still waiting on the
    /// worker fail with `ChannelClosed`.
    pub fn remove_process(&self, pid: i32) -> bool {
        let removed = self.lock_peers().remove(&pid).is_some();
        self.lock_pending().retain(|_, pending| pending.pid != pid);
        removed
    }

    pub fn add_method<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&IpcMessage, Responder) + Send + Sync + 'static,
    {
        self.shared
            .registry
            .write()
            .map_err(|_| SupervisorError::InvalidArgument("method registry poisoned".into()))?
            .add_method(name, handler)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.shared
            .registry
            .read()
            .map(|registry| registry.contains(name))
            .unwrap_or(false)
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.lock_peers().contains_key(&pid)
    }

    pub fn peers(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self.lock_peers().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Sends a request to one worker without waiting for the answer.
    pub fn request(&self, pid: i32, method: &str, args: Value) -> Result<u64> {
        let id = self.next_id();
        self.send(pid, IpcMessage::request(id, self.shared.pid, method, args))?;
        Ok(id)
    }

    /// Sends a request and waits for the worker's correlated response.
    pub async fn call(&self, pid: i32, method: &str, args: Value) -> Result<Value> {
        let id = self.next_id();
        let (waiter, rx) = oneshot::channel();
        self.lock_pending().insert(id, Pending { pid, waiter });

        if let Err(err) = self.send(pid, IpcMessage::request(id, self.shared.pid, method, args)) {
            self.lock_pending().remove(&id);
            return Err(err);
        }

        let response = rx.await.map_err(|_| SupervisorError::ChannelClosed)??;
        match response.error {
            Some(error) => Err(SupervisorError::Remote(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// Turns `message` into a response and routes it back to its sender.
    pub fn respond(
        &self,
        message: IpcMessage,
        error: Option<String>,
        result: Option<Value>,
    ) -> Result<()> {
        let pid = message.req_pid;
        self.send(pid, message.into_response(self.shared.pid, error, result))
    }

    /// Requests `method` on every registered worker. Workers that already
    /// went away are skipped silently.
    pub fn broadcast(&self, method: &str, args: Value) {
        for pid in self.peers() {
            if let Err(err) = self.request(pid, method, args.clone()) {
                log!(
                    self.shared.logger,
                    LogLevel::Debug,
                    "Broadcast {} skipped worker {}: {}",
                    method,
                    pid,
                    err
                );
            }
        }
    }

    /// Routes one inbound frame: responses complete pending calls, requests
    /// go to the method registry.
    pub fn dispatch(&self, inbound: InboundMessage) {
        let InboundMessage { pid, mut message } = inbound;

        if message.is_response() {
            match self.lock_pending().remove(&message.id) {
                Some(pending) => {
                    let _ = pending.waiter.send(Ok(message));
                }
                None => log!(
                    self.shared.logger,
                    LogLevel::Debug,
                    "Uncorrelated response {} from worker {}",
                    message.method,
                    pid
                ),
            }
            return;
        }

        if message.req_pid != pid {
            log!(
                self.shared.logger,
                LogLevel::Debug,
                "Worker {} sent reqPid {}, answering on its pipe",
                pid,
                message.req_pid
            );
            message.req_pid = pid;
        }

        let handler: Option<Arc<MethodFn>> = self
            .shared
            .registry
            .read()
            .ok()
            .and_then(|registry| registry.get(&message.method));

        match handler {
            Some(handler) => {
                let responder = Responder {
                    channel: self.clone(),
                    message: message.clone(),
                };
                handler(&message, responder);
            }
            None => log!(
                self.shared.logger,
                LogLevel::Warn,
                "{}",
                SupervisorError::UnregisteredMethod(message.method.clone())
            ),
        }
    }

    fn send(&self, pid: i32, message: IpcMessage) -> Result<()> {
        let peers = self.lock_peers();
        let peer = peers.get(&pid).ok_or(SupervisorError::UnknownPeer(pid))?;
        peer.outbound
            .send(message)
            .map_err(|_| SupervisorError::ChannelClosed)
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<i32, Peer>> {
        self.shared
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Pending>> {
        lock_pending(&self.shared)
    }
}

fn lock_pending(shared: &Shared) -> std::sync::MutexGuard<'_, HashMap<u64, Pending>> {
    shared
        .pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fails the `call` whose request frame could not be written.
fn fail_call(shared: &Weak<Shared>, message: &IpcMessage, err: SupervisorError) {
    if message.is_response() {
        return;
    }
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let pending = lock_pending(&shared).remove(&message.id);
    if let Some(pending) = pending {
        let _ = pending.waiter.send(Err(err));
    }
}

/// Reply handle given to every handler invocation.
pub struct Responder {
    channel: MasterChannel,
    message: IpcMessage,
}

impl Responder {
    /// Pid of the worker that sent the request.
    pub fn pid(&self) -> i32 {
        self.message.req_pid
    }

    pub fn respond(self, outcome: std::result::Result<Value, String>) {
        let (error, result) = match outcome {
            Ok(value) => (None, Some(value)),
            Err(error) => (Some(error), None),
        };
        let pid = self.message.req_pid;
        let method = self.message.method.clone();
        if let Err(err) = self.channel.respond(self.message, error, result) {
            log!(
                self.channel.shared.logger,
                LogLevel::Debug,
                "Response {} to worker {} dropped: {}",
                method,
                pid,
                err
            );
        }
    }

    pub fn ok(self, value: Value) {
        self.respond(Ok(value))
    }

    pub fn err(self, error: impl std::fmt::Display) {
        self.respond(Err(error.to_string()))
    }
}
