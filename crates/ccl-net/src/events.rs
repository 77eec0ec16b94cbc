use ccl_types::wire::PeerProgress;
use ccl_types::Rank;

/// Link-level events emitted by the background reader and writer tasks.
/// A process group consumes these to move itself into the faulted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link to `peer` broke (EOF, reset, undecodable frame, write error).
    Down { peer: Rank, reason: String },

    /// `peer` sent a goodbye and closed its end.
    Closed { peer: Rank },

    /// `peer` aborted collective `seq` and names `failed_peer` as the culprit.
    Abort {
        peer: Rank,
        seq: u64,
        failed_peer: Option<Rank>,
        reason: String,
    },

    /// `peer` asks how far this rank has got relative to collective `seq`.
    StatusQuery { peer: Rank, seq: u64 },

    /// `peer` answered a status query for collective `seq`.
    StatusReply {
        peer: Rank,
        seq: u64,
        progress: PeerProgress,
    },
}

impl LinkEvent {
    /// Rank whose link produced this event.
    pub fn peer(&self) -> Rank {
        match self {
            Self::Down { peer, .. }
            | Self::Closed { peer }
            | Self::Abort { peer, .. }
            | Self::StatusQuery { peer, .. }
            | Self::StatusReply { peer, .. } => *peer,
        }
    }
}
