// Messages exchanged on the control plane (rendezvous) and between peers.
//
// Shared across ccl-net and ccl-collective.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collective::CollectiveSignature;
use crate::Rank;

// ── Rendezvous ───────────────────────────────────────────────────────────────

/// Messages between a rank and the rendezvous coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RendezvousMessage {
    /// A rank announces itself and the endpoint its data-plane listener is
    /// bound to.
    CheckIn {
        rank: Rank,
        world_size: u32,
        endpoint: String,
    },

    /// Coordinator reply once every rank has checked in.
    /// `endpoints[i]` is rank `i`'s data-plane endpoint.
    Table {
        group_id: Uuid,
        endpoints: Vec<String>,
    },

    /// Coordinator refused the group (mismatch, duplicate, timeout).
    Rejected { reason: String },
}

// ── Peer control ─────────────────────────────────────────────────────────────

/// Non-data frames sent over a peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerControl {
    /// First frame on every dialed link.
    Hello { group_id: Uuid, rank: Rank },

    /// The sender aborted collective `seq`. Every receiver adopts
    /// `failed_peer` so all live ranks report the same culprit.
    Abort {
        seq: u64,
        failed_peer: Option<Rank>,
        reason: String,
    },

    /// Clean teardown: the sender is destroying its group.
    Goodbye,

    /// The sender has waited too long on collective `seq` and asks how far
    /// the receiver has got.
    StatusQuery { seq: u64 },

    /// Answer to a `StatusQuery` for `seq`.
    StatusReply { seq: u64, progress: PeerProgress },
}

/// Where a rank's collective engine stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerProgress {
    /// Between collectives; `next_seq` is the next one it will run.
    Idle { next_seq: u64 },
    /// Inside collective `seq`.
    Running { seq: u64 },
}

impl PeerProgress {
    /// True once the rank has entered collective `seq` or is blocked inside
    /// any collective. A rank that is idle and has not reached `seq` is not
    /// taking part in it.
    pub fn is_engaged(&self, seq: u64) -> bool {
        match *self {
            Self::Running { .. } => true,
            Self::Idle { next_seq } => next_seq > seq,
        }
    }
}

// ── Data ─────────────────────────────────────────────────────────────────────

/// Header preceding each data payload inside a collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Group-wide collective sequence number (program order).
    pub seq: u64,
    /// Algorithm step within the collective.
    pub step: u32,
    /// Index of this frame within a step's payload, which is split into
    /// frames no larger than the link's frame limit.
    pub chunk: u32,
    pub signature: CollectiveSignature,
}

/// A decoded peer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Control(PeerControl),
    Data {
        header: FrameHeader,
        payload: Vec<u8>,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
