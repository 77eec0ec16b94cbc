//! Group-wide fault tracking.
//!
//! A group records at most one fault: the first collective failure, link
//! failure, peer abort, or cancellation. Every later collective fails fast
//! with it, and any receive in flight is woken by it.
//!
//! The link monitor also answers peers' status queries.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ccl_net::{LinkEvent, LinkSet};
use ccl_types::{CclError, Rank};

use crate::liveness::Liveness;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub reason: String,
    pub failed_peer: Option<Rank>,
}

impl Fault {
    pub fn new(reason: impl Into<String>, failed_peer: Option<Rank>) -> Self {
        Self {
            reason: reason.into(),
            failed_peer,
        }
    }

    pub fn to_error(&self) -> CclError {
        CclError::collective(self.reason.clone(), self.failed_peer)
    }
}

/// Set-once fault cell shared by the engine, scheduler and link monitor.
#[derive(Debug, Clone)]
pub struct FaultSignal {
    tx: Arc<watch::Sender<Option<Fault>>>,
}

impl FaultSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record `fault` unless one is already recorded. Returns `true` if this
    /// call set it.
    pub fn record(&self, fault: Fault) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            warn!(reason = %fault.reason, failed_peer = ?fault.failed_peer, "group faulted");
            *current = Some(fault);
            true
        })
    }

    pub fn current(&self) -> Option<Fault> {
        self.tx.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Resolves once a fault is recorded; immediately if one already is.
    pub async fn wait(&self) -> Fault {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(fault) = rx.borrow_and_update().clone() {
                return fault;
            }
            if rx.changed().await.is_err() {
                // Sender lives in `self`, so this never happens.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for FaultSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ── Link monitor ─────────────────────────────────────────────────────────────

/// Turn link events into group faults, and answer status queries, until `shutdown`
/// fires.
pub(crate) fn spawn_monitor(
    rank: Rank,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    signal: FaultSignal,
    links: Arc<LinkSet>,
    liveness: Arc<Liveness>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };

            match event {
                LinkEvent::Down { peer, reason } => {
                    signal.record(Fault::new(
                        format!("link to rank {peer} lost: {reason}"),
                        Some(peer),
                    ));
                }
                LinkEvent::Abort { peer, seq, failed_peer, reason } => {
                    signal.record(Fault::new(
                        format!("rank {peer} aborted collective #{seq}: {reason}"),
                        failed_peer,
                    ));
                }
                LinkEvent::Closed { peer } => {
                    // Frames sent before the goodbye stay readable; a later
                    // receive from this peer fails on the closed link.
                    debug!(rank, peer, "peer closed its link");
                }
                LinkEvent::StatusQuery { peer, seq } => {
                    if let Err(e) = liveness.reply(&links, peer, seq) {
                        debug!(rank, peer, seq, %e, "status reply not sent");
                    }
                }
                LinkEvent::StatusReply { peer, seq, progress } => {
                    liveness.answer(peer, seq, progress);
                }
            }
        }
        debug!(rank, "link monitor stopped");
    })
}
