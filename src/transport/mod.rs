//! Correlated duplex transport for the push/command channel.
//!
//! One logical connection carries outbound commands and inbound
//! traffic. Every outbound command is stamped with a monotonically
//! increasing correlation id and resolved by the matching response
//! frame (`code == 200` succeeds, anything else rejects). Frames
//! without a correlation id are unsolicited pushes and go to the
//! single registered push handler as `(key, message)`.
//!
//! The raw socket is an external collaborator behind [`Connector`];
//! the transport queues frames while the channel is not open, flushes
//! on open, and reconnects with capped exponential backoff after a
//! close.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Success code on response envelopes
const SUCCESS_CODE: i64 = 200;

/// Initial reconnect backoff in milliseconds
const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Reconnect backoff ceiling in milliseconds
const MAX_BACKOFF_MS: u64 = 30_000;

/// Events a socket implementation reports upward.
#[derive(Debug)]
pub enum SocketEvent {
    Open,
    Message(String),
    Closed,
}

/// A connected duplex pair: frames out, events in.
pub struct SocketHandle {
    pub outbound: mpsc::UnboundedSender<String>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Produces a fresh duplex channel on every (re)connect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<SocketHandle>;
}

/// Commands the engine issues over the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartConsuming(String),
    StopConsuming(String),
}

impl Command {
    fn cmd(&self) -> &'static str {
        match self {
            Command::StartConsuming(_) => "startConsuming",
            Command::StopConsuming(_) => "stopConsuming",
        }
    }

    fn path(&self) -> &str {
        match self {
            Command::StartConsuming(path) | Command::StopConsuming(path) => path,
        }
    }
}

#[derive(Serialize)]
struct WireCommand<'a> {
    #[serde(rename = "_id")]
    id: u64,
    cmd: &'a str,
    path: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(rename = "_id")]
    id: u64,
    code: i64,
    #[serde(default)]
    msg: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct WirePush {
    k: String,
    m: Value,
}

pub type PushHandler = Box<dyn Fn(String, Value) + Send + Sync>;
pub type CloseHandler = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Shared {
    open: bool,
    outbound: Option<mpsc::UnboundedSender<String>>,
    queue: Vec<String>,
    pending: HashMap<u64, oneshot::Sender<Result<Value>>>,
    next_id: u64,
    task: Option<tokio::task::JoinHandle<()>>,
}

struct TransportInner {
    connector: Arc<dyn Connector>,
    timeout: Duration,
    shared: parking_lot::Mutex<Shared>,
    push_handler: parking_lot::Mutex<Option<PushHandler>>,
    close_handler: parking_lot::Mutex<Option<CloseHandler>>,
}

/// Clone is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                connector,
                timeout,
                shared: parking_lot::Mutex::new(Shared::default()),
                push_handler: parking_lot::Mutex::new(None),
                close_handler: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Handler for unsolicited `(key, message)` pushes.
    pub fn set_push_handler(&self, handler: impl Fn(String, Value) + Send + Sync + 'static) {
        *self.inner.push_handler.lock() = Some(Box::new(handler));
    }

    /// Handler fired when the channel drops; used to re-assert
    /// interest once reconnected.
    pub fn set_close_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.inner.close_handler.lock() = Some(Box::new(handler));
    }

    /// Open the connection; idempotent while the run loop is alive.
    pub fn open(&self) {
        let mut shared = self.inner.shared.lock();
        if shared.task.is_some() {
            return;
        }
        let inner = self.inner.clone();
        shared.task = Some(tokio::spawn(async move {
            run_loop(inner).await;
        }));
    }

    /// Tear the connection down; queued frames survive for the next
    /// open.
    pub fn close(&self) {
        let mut shared = self.inner.shared.lock();
        if let Some(task) = shared.task.take() {
            task.abort();
        }
        shared.open = false;
        shared.outbound = None;
    }

    pub fn is_open(&self) -> bool {
        self.inner.shared.lock().open
    }

    /// Send a command, resolving with the response payload once the
    /// matching correlation id comes back. Frames sent while the
    /// channel is not open are queued and flushed on open.
    pub async fn send(&self, command: Command) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut shared = self.inner.shared.lock();
            shared.next_id += 1;
            let id = shared.next_id;
            let frame = serde_json::to_string(&WireCommand {
                id,
                cmd: command.cmd(),
                path: command.path(),
            })?;
            shared.pending.insert(id, tx);
            let sent = match (&shared.outbound, shared.open) {
                (Some(outbound), true) => {
                    debug!(frame = %frame, "send");
                    outbound.send(frame.clone()).is_ok()
                }
                _ => false,
            };
            if !sent {
                shared.queue.push(frame);
            }
            id
        };

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport("response channel dropped".into())),
            Err(_) => {
                self.inner.shared.lock().pending.remove(&id);
                Err(Error::Timeout(self.inner.timeout))
            }
        }
    }
}

async fn run_loop(inner: Arc<TransportInner>) {
    let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
    loop {
        match inner.connector.connect().await {
            Ok(handle) => {
                backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
                inner.shared.lock().outbound = Some(handle.outbound);
                let mut events = handle.events;
                while let Some(event) = events.recv().await {
                    match event {
                        SocketEvent::Open => flush(&inner),
                        SocketEvent::Message(text) => handle_frame(&inner, &text),
                        SocketEvent::Closed => break,
                    }
                }
                {
                    let mut shared = inner.shared.lock();
                    shared.open = false;
                    shared.outbound = None;
                }
                debug!("channel closed, scheduling reconnect");
                if let Some(handler) = &*inner.close_handler.lock() {
                    handler();
                }
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
    }
}

/// Mark the channel open and drain the queue into it.
fn flush(inner: &TransportInner) {
    let mut shared = inner.shared.lock();
    shared.open = true;
    let frames = std::mem::take(&mut shared.queue);
    if let Some(outbound) = shared.outbound.clone() {
        for frame in frames {
            debug!(frame = %frame, "send (queued)");
            if outbound.send(frame).is_err() {
                break;
            }
        }
    }
}

/// One bad frame must not stop subsequent frames.
fn handle_frame(inner: &TransportInner, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "unparseable frame");
            return;
        }
    };
    if value.get("_id").is_some() {
        let response: WireResponse = match serde_json::from_value(value) {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "malformed response envelope");
                return;
            }
        };
        let waiter = inner.shared.lock().pending.remove(&response.id);
        let Some(waiter) = waiter else {
            warn!(id = response.id, "response without a pending request");
            return;
        };
        let result = if response.code == SUCCESS_CODE {
            Ok(response.msg.unwrap_or(Value::Null))
        } else {
            Err(Error::CommandRejected {
                code: response.code,
                detail: response
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string()),
            })
        };
        let _ = waiter.send(result);
        return;
    }
    let push: WirePush = match serde_json::from_value(value) {
        Ok(push) => push,
        Err(e) => {
            error!(error = %e, "malformed push envelope");
            return;
        }
    };
    match &*inner.push_handler.lock() {
        Some(handler) => handler(push.k, push.m),
        None => debug!(key = %push.k, "push with no handler registered"),
    }
}
