use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use serde_json::Value;
use tokio::{
    net::UnixStream,
    sync::{mpsc, oneshot, watch},
};

use crate::{
    error::{Result, SupervisorError},
    ipc::{message::IpcMessage, registry::validate_method_name},
    socket_communication::{receive_message, send_message},
};

type Callback = Box<dyn FnOnce(Option<String>, Option<Value>, &IpcMessage) + Send>;
type Listener = Arc<dyn Fn(&IpcMessage) + Send + Sync>;

enum Outbound {
    Frame(IpcMessage),
    // Acknowledged once every frame queued before it has been written.
    Flush(oneshot::Sender<()>),
}

struct Shared {
    pid: i32,
    outbound: mpsc::UnboundedSender<Outbound>,
    // In-flight requests by correlation id.
    pending: Mutex<HashMap<u64, Callback>>,
    // Broadcast subscriptions by method name.
    listeners: Mutex<HashMap<String, Listener>>,
    next_id: AtomicU64,
    closed: watch::Sender<bool>,
}

/// Worker side of the IPC channel. The only peer is the master.
#[derive(Clone)]
pub struct WorkerChannel {
    shared: Arc<Shared>,
}

impl WorkerChannel {
    /// Starts the reader and writer tasks over the master pipe.
    pub fn open(stream: UnixStream, pid: i32) -> Self {
        let (mut read_half, mut write_half) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (closed, _) = watch::channel(false);

        let channel = Self {
            shared: Arc::new(Shared {
                pid,
                outbound,
                pending: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed,
            }),
        };

        let shared = Arc::downgrade(&channel.shared);
        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Frame(message) => match send_message(&mut write_half, &message).await {
                        Ok(()) => {}
                        // Nothing reached the pipe; only this request fails.
                        Err(err) if err.is_frame_error() => fail_request(&shared, &message, err),
                        Err(_) => break,
                    },
                    Outbound::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        let reader = channel.clone();
        tokio::spawn(async move {
            loop {
                match receive_message::<_, IpcMessage>(&mut read_half).await {
                    Ok(Some(message)) => reader.deliver(message),
                    Err(err) if err.is_frame_error() => continue,
                    Ok(None) | Err(_) => break,
                }
            }
            // `request` relies on closed being published before pending is cleared.
            reader.shared.closed.send_replace(true);
            reader.lock_pending().clear();
        });

        channel
    }

    pub fn pid(&self) -> i32 {
        self.shared.pid
    }

    /// Sends `method` to the master; `callback` fires once with
    /// `(error, result, raw_response)` when the correlated response arrives.
    pub fn request<F>(&self, method: &str, args: Value, callback: F) -> Result<u64>
    where
        F: FnOnce(Option<String>, Option<Value>, &IpcMessage) + Send + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_pending().insert(id, Box::new(callback));
        if self.is_closed() {
            self.lock_pending().remove(&id);
            return Err(SupervisorError::ChannelClosed);
        }

        if let Err(err) = self.send(IpcMessage::request(id, self.shared.pid, method, args)) {
            self.lock_pending().remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    pub async fn call(&self, method: &str, args: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.request(method, args, move |error, result, _| {
            let _ = tx.send(match error {
                Some(error) => Err(error),
                None => Ok(result.unwrap_or(Value::Null)),
            });
        })?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(SupervisorError::Remote(error)),
            Err(_) => Err(SupervisorError::ChannelClosed),
        }
    }

    /// Fire-and-forget request. Any response is discarded.
    pub fn notify(&self, method: &str, args: Value) -> Result<()> {
        self.send(IpcMessage::request(0, self.shared.pid, method, args))
    }

    /// Subscribes to unsolicited messages for `method`. Replaces an earlier
    /// listener for the same method; never touches in-flight requests.
    pub fn add_broadcast_listener<F>(&self, method: &str, callback: F) -> Result<()>
    where
        F: Fn(&IpcMessage) + Send + Sync + 'static,
    {
        validate_method_name(method)?;
        self.lock_listeners()
            .insert(method.to_owned(), Arc::new(callback));
        Ok(())
    }

    /// Answers a request the master sent to this worker.
    pub fn respond(
        &self,
        message: &IpcMessage,
        error: Option<String>,
        result: Option<Value>,
    ) -> Result<()> {
        self.send(message.clone().into_response(self.shared.pid, error, result))
    }

    pub fn remove_broadcast_listener(&self, method: &str) -> bool {
        self.lock_listeners().remove(method).is_some()
    }

    /// Waits until every message sent so far has been written to the pipe.
    pub async fn flush(&self) -> Result<()> {
        let (done, written) = oneshot::channel();
        self.shared
            .outbound
            .send(Outbound::Flush(done))
            .map_err(|_| SupervisorError::ChannelClosed)?;
        written.await.map_err(|_| SupervisorError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the master end of the pipe is gone.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    fn deliver(&self, message: IpcMessage) {
        if message.is_response() {
            let callback = self.lock_pending().remove(&message.id);
            if let Some(callback) = callback {
                callback(message.error.clone(), message.result.clone(), &message);
            }
            return;
        }

        let listener = self.lock_listeners().get(&message.method).cloned();
        // Nobody subscribed: the message is dropped, the master does not wait.
        if let Some(listener) = listener {
            listener(&message);
        }
    }

    fn send(&self, message: IpcMessage) -> Result<()> {
        self.shared
            .outbound
            .send(Outbound::Frame(message))
            .map_err(|_| SupervisorError::ChannelClosed)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Callback>> {
        lock_pending(&self.shared)
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, HashMap<String, Listener>> {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lock_pending(shared: &Shared) -> std::sync::MutexGuard<'_, HashMap<u64, Callback>> {
    shared
        .pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Completes the pending request behind an unsendable frame with `err`.
fn fail_request(shared: &Weak<Shared>, message: &IpcMessage, err: SupervisorError) {
    if message.is_response() {
        return;
    }
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let callback = lock_pending(&shared).remove(&message.id);
    if let Some(callback) = callback {
        callback(Some(err.to_string()), None, message);
    }
}
