//! FIFO submission of collectives.
//!
//! ```text
//! submit ─┐
//! submit ─┼─▶ [ mpsc queue ] ─▶ dispatcher task ─▶ CollectiveEngine
//! submit ─┘                          │
//!                                    └─▶ oneshot per request ─▶ CompletionHandle
//! ```
//!
//! One dispatcher per group runs requests strictly in submission order, so
//! local program order is engine order. Every rank must submit the same
//! collectives in the same order; the scheduler does not check this.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ccl_types::{CclError, CollectiveKind, CollectiveOutput, CollectiveRequest, Result};

use crate::engine::CollectiveEngine;
use crate::fault::{Fault, FaultSignal};

// ── Status ───────────────────────────────────────────────────────────────────

/// Queued → Running → Completed | Failed | Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued    => write!(f, "Queued"),
            Self::Running   => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed    => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Tracks one submitted collective.
pub struct CompletionHandle {
    id: u64,
    kind: CollectiveKind,
    status: watch::Receiver<RequestStatus>,
    cancel: CancellationToken,
    fault: FaultSignal,
    result: oneshot::Receiver<Result<CollectiveOutput>>,
}

impl CompletionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> CollectiveKind {
        self.kind
    }

    /// Current status, without blocking.
    pub fn query(&self) -> RequestStatus {
        *self.status.borrow()
    }

    pub fn is_completed(&self) -> bool {
        self.query().is_finished()
    }

    /// Best-effort cancellation. A queued request is skipped and a running
    /// one aborted. Either way the group becomes faulted, since peers can no
    /// longer line up with this rank's collective sequence.
    pub fn cancel(&self) {
        if self.is_completed() {
            return;
        }
        self.cancel.cancel();
        self.fault.record(Fault::new(
            format!("request {} ({}) was cancelled", self.id, self.kind),
            None,
        ));
    }

    /// Wait for the collective and take back its buffers.
    pub async fn wait(self) -> Result<CollectiveOutput> {
        self.result.await.unwrap_or_else(|_| {
            Err(CclError::InvalidState(
                "process group was destroyed before the request ran".into(),
            ))
        })
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.query())
            .finish()
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────────

struct Job {
    id: u64,
    request: CollectiveRequest,
    status: watch::Sender<RequestStatus>,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<CollectiveOutput>>,
}

pub struct OperationScheduler {
    queue: mpsc::Sender<Job>,
    next_id: AtomicU64,
    fault: FaultSignal,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl OperationScheduler {
    /// Spawn the dispatcher task that owns `engine`.
    pub fn spawn(
        engine: CollectiveEngine,
        queue_depth: usize,
        fault: FaultSignal,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let dispatcher = tokio::spawn(dispatch_loop(engine, rx, shutdown.clone()));
        Self {
            queue: tx,
            next_id: AtomicU64::new(0),
            fault,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Enqueue `request` and return immediately with a handle. Waits only
    /// when the queue is full.
    pub async fn submit_async(&self, request: CollectiveRequest) -> Result<CompletionHandle> {
        if self.shutdown.is_cancelled() {
            return Err(destroyed());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        let (status_tx, status_rx) = watch::channel(RequestStatus::Queued);
        let (reply_tx, reply_rx) = oneshot::channel();
        let cancel = self.shutdown.child_token();

        let job = Job {
            id,
            request,
            status: status_tx,
            cancel: cancel.clone(),
            reply: reply_tx,
        };
        self.queue.send(job).await.map_err(|_| destroyed())?;
        debug!(id, %kind, "request queued");

        Ok(CompletionHandle {
            id,
            kind,
            status: status_rx,
            cancel,
            fault: self.fault.clone(),
            result: reply_rx,
        })
    }

    /// Enqueue `request` and wait for it.
    pub async fn submit(&self, request: CollectiveRequest) -> Result<CollectiveOutput> {
        self.submit_async(request).await?.wait().await
    }

    /// Stop the dispatcher. Queued requests fail with `InvalidState`; a
    /// running one is cancelled.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn destroyed() -> CclError {
    CclError::InvalidState("process group has been destroyed".into())
}

async fn dispatch_loop(
    mut engine: CollectiveEngine,
    mut queue: mpsc::Receiver<Job>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = queue.recv() => job,
        };
        let Some(job) = job else {
            break;
        };

        if job.cancel.is_cancelled() {
            let _ = job.status.send(RequestStatus::Cancelled);
            let _ = job.reply.send(Err(CclError::collective(
                format!("request {} was cancelled before it ran", job.id),
                None,
            )));
            continue;
        }

        let _ = job.status.send(RequestStatus::Running);
        let result = engine.execute(job.request, &job.cancel).await;
        let status = match &result {
            Ok(_) => RequestStatus::Completed,
            Err(_) if job.cancel.is_cancelled() => RequestStatus::Cancelled,
            Err(_) => RequestStatus::Failed,
        };
        debug!(id = job.id, %status, "request finished");
        let _ = job.status.send(status);
        let _ = job.reply.send(result);
    }

    // Drain what is left so every waiter gets an answer.
    queue.close();
    while let Ok(job) = queue.try_recv() {
        let _ = job.status.send(RequestStatus::Failed);
        let _ = job.reply.send(Err(destroyed()));
    }
    info!(next_seq = engine.next_seq(), "dispatcher stopped");
}
