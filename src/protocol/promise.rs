//! Reply correlation
//!
//! Two halves of one round trip:
//! - [`Promise`] lives with the receiver of an operation and is answered exactly once.
//! - [`PendingReplies`] / [`ResponseFuture`] live with the sender and resolve
//!   when the matching reply arrives (or the caller gives up).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use super::address::{SimulatorAddress, Target};
use super::operation::{Envelope, OperationEnvelope, ReplyEnvelope};
use crate::error::{Result, SimulatorError};
use crate::transport::Transport;

/// Tag carried by an error reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// The receiver processed the operation and it failed
    Failed,
    /// The receiver does not handle this operation type
    Unsupported,
    /// The agent could not start the requested worker
    WorkerCreateError,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::Failed => write!(f, "failed"),
            RemoteErrorKind::Unsupported => write!(f, "unsupported"),
            RemoteErrorKind::WorkerCreateError => write!(f, "worker create error"),
        }
    }
}

/// Error half of a tagged reply
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of a round trip: stringified result or a tagged error
pub type Response = std::result::Result<String, RemoteError>;

enum ReplySink {
    Remote {
        transport: Arc<dyn Transport>,
        source: SimulatorAddress,
        reply_to: SimulatorAddress,
        correlation_id: u64,
    },
    Local(Mutex<Option<oneshot::Sender<Response>>>),
    Detached,
}

/// One-shot reply handle bound to a reply destination
pub struct Promise {
    sink: ReplySink,
    resolved: AtomicBool,
}

impl Promise {
    /// Promise answering `envelope`; detached when the operation was fire-and-forget
    pub fn for_envelope(
        envelope: &OperationEnvelope,
        local: SimulatorAddress,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let sink = match envelope.correlation_id {
            Some(correlation_id) => ReplySink::Remote {
                transport,
                source: local,
                reply_to: envelope.source,
                correlation_id,
            },
            None => ReplySink::Detached,
        };
        Self {
            sink,
            resolved: AtomicBool::new(false),
        }
    }

    /// In-process promise; the receiver observes the answer
    pub fn local() -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sink: ReplySink::Local(Mutex::new(Some(tx))),
                resolved: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Promise nobody waits on
    pub fn detached() -> Self {
        Self {
            sink: ReplySink::Detached,
            resolved: AtomicBool::new(false),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Resolve the promise. Returns false (and sends nothing) if it was already resolved.
    pub async fn answer(&self, response: Response) -> bool {
        if self.resolved.swap(true, Ordering::SeqCst) {
            warn!("Promise already answered, dropping second answer: {:?}", response);
            return false;
        }

        match &self.sink {
            ReplySink::Remote {
                transport,
                source,
                reply_to,
                correlation_id,
            } => {
                let reply = ReplyEnvelope::new(*correlation_id, *source, *reply_to, response);
                if let Err(e) = transport.send(Envelope::Reply(reply)).await {
                    warn!("Failed to send reply {} to {}: {}", correlation_id, reply_to, e);
                }
            }
            ReplySink::Local(tx) => {
                if let Some(tx) = tx.lock().await.take() {
                    let _ = tx.send(response);
                }
            }
            ReplySink::Detached => {}
        }
        true
    }

    pub async fn ok(&self, payload: impl Into<String>) -> bool {
        self.answer(Ok(payload.into())).await
    }

    pub async fn fail(&self, kind: RemoteErrorKind, message: impl Into<String>) -> bool {
        self.answer(Err(RemoteError::new(kind, message))).await
    }
}

/// Sender-side table of outstanding round trips, keyed by correlation id
#[derive(Default)]
pub struct PendingReplies {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Response>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a correlation id and register its reply slot
    pub fn register(self: &Arc<Self>, target: Target) -> ResponseFuture {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);
        ResponseFuture {
            correlation_id,
            target,
            rx,
            pending: self.clone(),
        }
    }

    /// Resolve the caller waiting on `reply`. Late and duplicate replies return false.
    pub fn complete(&self, reply: ReplyEnvelope) -> bool {
        match self.pending.remove(&reply.correlation_id) {
            Some((_, tx)) => tx.send(reply.into_response()).is_ok(),
            None => {
                debug!(
                    "Dropping reply {} from {}: no pending caller",
                    reply.correlation_id, reply.source
                );
                false
            }
        }
    }

    pub fn cancel(&self, correlation_id: u64) {
        self.pending.remove(&correlation_id);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Caller's view of an outstanding reply
pub struct ResponseFuture {
    correlation_id: u64,
    target: Target,
    rx: oneshot::Receiver<Response>,
    pending: Arc<PendingReplies>,
}

impl ResponseFuture {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Wait for the reply. On timeout the slot is released so it cannot leak.
    pub async fn get(self, timeout: Duration) -> Result<String> {
        let Self {
            correlation_id,
            target,
            rx,
            pending,
        } = self;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(remote))) => Err(SimulatorError::Remote(remote)),
            Ok(Err(_)) => Err(SimulatorError::Cancelled),
            Err(_) => {
                pending.cancel(correlation_id);
                Err(SimulatorError::ReplyTimeout {
                    target: target.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}
