//! Collective progress of this rank, and queries that ask a peer for its own.
//!
//! When a receive times out the engine queries the peer it is waiting on. A
//! peer that reports itself engaged in the collective is blocked behind some
//! other rank, so the receive keeps waiting for that rank's abort. A peer
//! that is idle short of the collective, or never answers, is the one that
//! stalled. Every blocked rank therefore names the same culprit.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use ccl_net::{codec, Link, LinkSet};
use ccl_types::wire::{PeerControl, PeerProgress};
use ccl_types::{Rank, Result};

type Pending = HashMap<(Rank, u64), oneshot::Sender<PeerProgress>>;

pub struct Liveness {
    progress: Mutex<PeerProgress>,
    pending: Mutex<Pending>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            progress: Mutex::new(PeerProgress::Idle { next_seq: 0 }),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn progress(&self) -> PeerProgress {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set(&self, progress: PeerProgress) {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = progress;
    }

    /// Ask `link`'s peer where it stands relative to collective `seq`.
    /// `None` if it does not answer within `wait`.
    pub async fn query(&self, link: &Link, seq: u64, wait: Duration) -> Option<PeerProgress> {
        let key = (link.peer(), seq);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(key, tx);

        let sent = codec::encode_control(&PeerControl::StatusQuery { seq }).and_then(|f| link.try_send(f));
        let reply = match sent {
            Ok(()) => tokio::time::timeout(wait, rx).await.ok().and_then(|r| r.ok()),
            Err(e) => {
                debug!(peer = link.peer(), seq, %e, "status query not sent");
                None
            }
        };
        self.pending().remove(&key);
        reply
    }

    /// Complete the query waiting on `peer`'s reply for `seq`, if any.
    pub(crate) fn answer(&self, peer: Rank, seq: u64, progress: PeerProgress) {
        match self.pending().remove(&(peer, seq)) {
            Some(waiter) => {
                let _ = waiter.send(progress);
            }
            None => trace!(peer, seq, "late status reply"),
        }
    }

    /// Reply to `peer`'s status query with this rank's progress.
    pub(crate) fn reply(&self, links: &LinkSet, peer: Rank, seq: u64) -> Result<()> {
        let progress = self.progress();
        trace!(peer, seq, ?progress, "answering status query");
        let frame = codec::encode_control(&PeerControl::StatusReply { seq, progress })?;
        links.get(peer)?.try_send(frame)
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}
