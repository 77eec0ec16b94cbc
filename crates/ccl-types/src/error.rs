// Global error taxonomy. Every library crate in the workspace returns these.

use std::io;

use crate::Rank;

#[derive(Debug, thiserror::Error)]
pub enum CclError {
    // ── Group formation ───────────────────────────────────────────────────

    /// Rendezvous did not complete: timeout, world-size mismatch, duplicate
    /// or out-of-range rank.
    #[error("rendezvous error: {0}")]
    Rendezvous(String),

    // ── Links ─────────────────────────────────────────────────────────────

    /// A peer could not be reached within the connect timeout.
    #[error("connection error: rank {peer} unreachable: {reason}")]
    Connection { peer: Rank, reason: String },

    /// A link failed mid-transfer, or no usable transport exists.
    #[error("transport error: {reason}")]
    Transport { peer: Option<Rank>, reason: String },

    // ── Collectives ───────────────────────────────────────────────────────

    /// A collective aborted mid-algorithm. `failed_peer` is the first peer
    /// observed to be unreachable or failing, when one is known.
    #[error("collective error: {reason}")]
    Collective {
        reason: String,
        failed_peer: Option<Rank>,
    },

    /// Operation on a destroyed or not-yet-initialized group.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Debug-mode signature check: a peer is running a different collective.
    #[error("mismatched collective with rank {peer}: expected {expected}, got {actual}")]
    MismatchedCollective {
        peer: Rank,
        expected: String,
        actual: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CclError {
    pub fn collective(reason: impl Into<String>, failed_peer: Option<Rank>) -> Self {
        Self::Collective {
            reason: reason.into(),
            failed_peer,
        }
    }

    pub fn transport(peer: Option<Rank>, reason: impl Into<String>) -> Self {
        Self::Transport {
            peer,
            reason: reason.into(),
        }
    }

    /// The peer this error is attributed to, if any.
    pub fn peer(&self) -> Option<Rank> {
        match self {
            Self::Connection { peer, .. } => Some(*peer),
            Self::Transport { peer, .. } => *peer,
            Self::Collective { failed_peer, .. } => *failed_peer,
            Self::MismatchedCollective { peer, .. } => Some(*peer),
            _ => None,
        }
    }

    /// Link-level failures (`Connection`/`Transport`) seen during a
    /// collective are reported to the caller as `Collective` errors.
    pub fn into_collective(self) -> Self {
        match self {
            Self::Connection { peer, reason } => Self::Collective {
                reason: format!("connection to rank {peer} lost: {reason}"),
                failed_peer: Some(peer),
            },
            Self::Transport { peer, reason } => Self::Collective {
                reason,
                failed_peer: peer,
            },
            other => other,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CclError>;
