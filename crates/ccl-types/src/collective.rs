// Collective requests, their results, and the signature used for the
// cross-rank consistency check.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, DataType};
use crate::error::{CclError, Result};
use crate::Rank;

// ── Reduce Op ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Product,
    Min,
    Max,
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum     => write!(f, "sum"),
            Self::Product => write!(f, "product"),
            Self::Min     => write!(f, "min"),
            Self::Max     => write!(f, "max"),
        }
    }
}

impl FromStr for ReduceOp {
    type Err = CclError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sum"              => Ok(Self::Sum),
            "product" | "prod" => Ok(Self::Product),
            "min"              => Ok(Self::Min),
            "max"              => Ok(Self::Max),
            other => Err(CclError::InvalidArgument(format!("unknown reduce op '{other}'"))),
        }
    }
}

// ── Kind ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectiveKind {
    Broadcast,
    Reduce,
    AllReduce,
    AllGather,
    Gather,
    Scatter,
    AllToAll,
    Barrier,
}

impl fmt::Display for CollectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => write!(f, "broadcast"),
            Self::Reduce    => write!(f, "reduce"),
            Self::AllReduce => write!(f, "all_reduce"),
            Self::AllGather => write!(f, "all_gather"),
            Self::Gather    => write!(f, "gather"),
            Self::Scatter   => write!(f, "scatter"),
            Self::AllToAll  => write!(f, "all_to_all"),
            Self::Barrier   => write!(f, "barrier"),
        }
    }
}

impl FromStr for CollectiveKind {
    type Err = CclError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "broadcast" | "bcast"       => Ok(Self::Broadcast),
            "reduce"                    => Ok(Self::Reduce),
            "allreduce" | "all_reduce"  => Ok(Self::AllReduce),
            "allgather" | "all_gather"  => Ok(Self::AllGather),
            "gather"                    => Ok(Self::Gather),
            "scatter"                   => Ok(Self::Scatter),
            "alltoall" | "all_to_all"   => Ok(Self::AllToAll),
            "barrier"                   => Ok(Self::Barrier),
            other => Err(CclError::InvalidArgument(format!("unknown collective '{other}'"))),
        }
    }
}

// ── Signature ────────────────────────────────────────────────────────────────

/// Everything every rank must agree on for a collective to line up.
///
/// Embedded in each data frame. `count` is an element count every rank
/// shares: the per-rank count for broadcast and the reductions, the total
/// for all-gather, and 0 for gather, scatter and all-to-all, whose per-rank
/// sizes may differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectiveSignature {
    pub kind: CollectiveKind,
    pub dtype: Option<DataType>,
    pub count: u64,
    pub root: Option<Rank>,
    pub op: Option<ReduceOp>,
}

impl fmt::Display for CollectiveSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(dtype) = self.dtype {
            write!(f, "({} x {dtype}", self.count)?;
            if let Some(op) = self.op {
                write!(f, ", op={op}")?;
            }
            if let Some(root) = self.root {
                write!(f, ", root={root}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

// ── Request ──────────────────────────────────────────────────────────────────

/// One collective submitted by the local rank. Buffers are moved in and
/// handed back through [`CollectiveOutput`] on completion.
#[derive(Debug)]
pub enum CollectiveRequest {
    /// Root's `buffer` becomes every rank's `buffer`.
    Broadcast { root: Rank, buffer: Buffer },

    /// Elementwise `op` over every rank's `input`; only root's `output` is
    /// written.
    Reduce {
        root: Rank,
        op: ReduceOp,
        input: Buffer,
        output: Buffer,
    },

    /// Every rank's `output` receives the full reduction.
    AllReduce {
        op: ReduceOp,
        input: Buffer,
        output: Buffer,
    },

    /// `outputs[i]` receives rank `i`'s `input`. Per-rank counts may differ,
    /// but `outputs[i]` must be sized for rank `i`'s contribution.
    AllGather { input: Buffer, outputs: Vec<Buffer> },

    /// Root's `outputs[i]` receives rank `i`'s `input`. `outputs` must be
    /// empty on every other rank.
    Gather {
        root: Rank,
        input: Buffer,
        outputs: Vec<Buffer>,
    },

    /// Rank `i`'s `output` receives root's `inputs[i]`. `inputs` must be
    /// empty on every other rank.
    Scatter {
        root: Rank,
        inputs: Vec<Buffer>,
        output: Buffer,
    },

    /// `inputs[j]` goes to rank `j`; `outputs[j]` receives rank `j`'s
    /// `inputs[rank]`.
    AllToAll {
        inputs: Vec<Buffer>,
        outputs: Vec<Buffer>,
    },

    Barrier,
}

impl CollectiveRequest {
    pub fn kind(&self) -> CollectiveKind {
        match self {
            Self::Broadcast { .. } => CollectiveKind::Broadcast,
            Self::Reduce { .. }    => CollectiveKind::Reduce,
            Self::AllReduce { .. } => CollectiveKind::AllReduce,
            Self::AllGather { .. } => CollectiveKind::AllGather,
            Self::Gather { .. }    => CollectiveKind::Gather,
            Self::Scatter { .. }   => CollectiveKind::Scatter,
            Self::AllToAll { .. }  => CollectiveKind::AllToAll,
            Self::Barrier          => CollectiveKind::Barrier,
        }
    }

    pub fn signature(&self) -> CollectiveSignature {
        match self {
            Self::Broadcast { root, buffer } => CollectiveSignature {
                kind: CollectiveKind::Broadcast,
                dtype: Some(buffer.dtype()),
                count: buffer.count() as u64,
                root: Some(*root),
                op: None,
            },
            Self::Reduce { root, op, input, .. } => CollectiveSignature {
                kind: CollectiveKind::Reduce,
                dtype: Some(input.dtype()),
                count: input.count() as u64,
                root: Some(*root),
                op: Some(*op),
            },
            Self::AllReduce { op, input, .. } => CollectiveSignature {
                kind: CollectiveKind::AllReduce,
                dtype: Some(input.dtype()),
                count: input.count() as u64,
                root: None,
                op: Some(*op),
            },
            Self::AllGather { input, outputs } => CollectiveSignature {
                kind: CollectiveKind::AllGather,
                dtype: Some(input.dtype()),
                count: outputs.iter().map(|b| b.count() as u64).sum(),
                root: None,
                op: None,
            },
            Self::Gather { root, input, .. } => CollectiveSignature {
                kind: CollectiveKind::Gather,
                dtype: Some(input.dtype()),
                count: 0,
                root: Some(*root),
                op: None,
            },
            Self::Scatter { root, output, .. } => CollectiveSignature {
                kind: CollectiveKind::Scatter,
                dtype: Some(output.dtype()),
                count: 0,
                root: Some(*root),
                op: None,
            },
            Self::AllToAll { outputs, .. } => CollectiveSignature {
                kind: CollectiveKind::AllToAll,
                dtype: outputs.first().map(Buffer::dtype),
                count: 0,
                root: None,
                op: None,
            },
            Self::Barrier => CollectiveSignature {
                kind: CollectiveKind::Barrier,
                dtype: None,
                count: 0,
                root: None,
                op: None,
            },
        }
    }

    /// Argument checks that need no communication.
    pub fn validate(&self, rank: Rank, world_size: u32) -> Result<()> {
        let check_root = |root: Rank| {
            if root >= world_size {
                Err(CclError::InvalidArgument(format!(
                    "root {root} out of range for world size {world_size}"
                )))
            } else {
                Ok(())
            }
        };

        match self {
            Self::Broadcast { root, .. } => check_root(*root),
            Self::Reduce { root, input, output, .. } => {
                check_root(*root)?;
                check_same_layout(input, output)
            }
            Self::AllReduce { input, output, .. } => check_same_layout(input, output),
            Self::AllGather { input, outputs } => {
                if outputs.len() != world_size as usize {
                    return Err(CclError::InvalidArgument(format!(
                        "all_gather needs {world_size} output buffers, got {}",
                        outputs.len()
                    )));
                }
                if let Some(bad) = outputs.iter().find(|o| o.dtype() != input.dtype()) {
                    return Err(CclError::InvalidArgument(format!(
                        "all_gather output dtype {} differs from input dtype {}",
                        bad.dtype(),
                        input.dtype()
                    )));
                }
                let own = &outputs[rank as usize];
                if own.count() != input.count() {
                    return Err(CclError::InvalidArgument(format!(
                        "all_gather output slot {rank} holds {} elements, input has {}",
                        own.count(),
                        input.count()
                    )));
                }
                Ok(())
            }
            Self::Gather { root, input, outputs } => {
                check_root(*root)?;
                if rank != *root {
                    return check_empty("gather", "output", outputs);
                }
                check_slots("gather", "output", outputs, input.dtype(), world_size)?;
                check_same_layout(input, &outputs[rank as usize])
            }
            Self::Scatter { root, inputs, output } => {
                check_root(*root)?;
                if rank != *root {
                    return check_empty("scatter", "input", inputs);
                }
                check_slots("scatter", "input", inputs, output.dtype(), world_size)?;
                check_same_layout(&inputs[rank as usize], output)
            }
            Self::AllToAll { inputs, outputs } => {
                let Some(first) = inputs.first() else {
                    return Err(CclError::InvalidArgument(
                        "all_to_all needs one input buffer per rank".into(),
                    ));
                };
                check_slots("all_to_all", "input", inputs, first.dtype(), world_size)?;
                check_slots("all_to_all", "output", outputs, first.dtype(), world_size)?;
                check_same_layout(&inputs[rank as usize], &outputs[rank as usize])
            }
            Self::Barrier => Ok(()),
        }
    }
}

fn check_empty(kind: &str, role: &str, buffers: &[Buffer]) -> Result<()> {
    if buffers.is_empty() {
        Ok(())
    } else {
        Err(CclError::InvalidArgument(format!(
            "{kind}: non-root ranks pass no {role} buffers, got {}",
            buffers.len()
        )))
    }
}

/// One buffer per rank, all of `dtype`.
fn check_slots(kind: &str, role: &str, buffers: &[Buffer], dtype: DataType, world_size: u32) -> Result<()> {
    if buffers.len() != world_size as usize {
        return Err(CclError::InvalidArgument(format!(
            "{kind} needs {world_size} {role} buffers, got {}",
            buffers.len()
        )));
    }
    match buffers.iter().find(|b| b.dtype() != dtype) {
        Some(bad) => Err(CclError::InvalidArgument(format!(
            "{kind} {role} dtype {} differs from {dtype}",
            bad.dtype()
        ))),
        None => Ok(()),
    }
}

fn check_same_layout(input: &Buffer, output: &Buffer) -> Result<()> {
    if input.same_layout(output) {
        Ok(())
    } else {
        Err(CclError::InvalidArgument(format!(
            "input ({} x {}) and output ({} x {}) are not equal in size or data type",
            input.count(),
            input.dtype(),
            output.count(),
            output.dtype()
        )))
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

/// Buffers returned to the caller once a collective completes.
#[derive(Debug)]
pub enum CollectiveOutput {
    Broadcast { buffer: Buffer },
    Reduce { input: Buffer, output: Buffer },
    AllReduce { input: Buffer, output: Buffer },
    AllGather { input: Buffer, outputs: Vec<Buffer> },
    Gather { input: Buffer, outputs: Vec<Buffer> },
    Scatter { inputs: Vec<Buffer>, output: Buffer },
    AllToAll { inputs: Vec<Buffer>, outputs: Vec<Buffer> },
    Barrier,
}

impl CollectiveOutput {
    pub fn kind(&self) -> CollectiveKind {
        match self {
            Self::Broadcast { .. } => CollectiveKind::Broadcast,
            Self::Reduce { .. }    => CollectiveKind::Reduce,
            Self::AllReduce { .. } => CollectiveKind::AllReduce,
            Self::AllGather { .. } => CollectiveKind::AllGather,
            Self::Gather { .. }    => CollectiveKind::Gather,
            Self::Scatter { .. }   => CollectiveKind::Scatter,
            Self::AllToAll { .. }  => CollectiveKind::AllToAll,
            Self::Barrier          => CollectiveKind::Barrier,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names_from_workload_files() {
        assert_eq!("allreduce".parse::<CollectiveKind>().unwrap(), CollectiveKind::AllReduce);
        assert_eq!("allgather".parse::<CollectiveKind>().unwrap(), CollectiveKind::AllGather);
        assert_eq!("broadcast".parse::<CollectiveKind>().unwrap(), CollectiveKind::Broadcast);
        assert_eq!("alltoall".parse::<CollectiveKind>().unwrap(), CollectiveKind::AllToAll);
        assert_eq!("prod".parse::<ReduceOp>().unwrap(), ReduceOp::Product);
        assert!("reduce_scatter".parse::<CollectiveKind>().is_err());
    }

    #[test]
    fn signature_tracks_root_and_op() {
        let req = CollectiveRequest::Reduce {
            root: 2,
            op: ReduceOp::Max,
            input: Buffer::from_f32(&[1.0; 4]),
            output: Buffer::zeros(DataType::F32, 4),
        };
        let sig = req.signature();
        assert_eq!(sig.kind, CollectiveKind::Reduce);
        assert_eq!(sig.root, Some(2));
        assert_eq!(sig.op, Some(ReduceOp::Max));
        assert_eq!(sig.count, 4);
        assert_eq!(sig.to_string(), "reduce(4 x f32, op=max, root=2)");
    }

    #[test]
    fn validate_rejects_bad_root() {
        let req = CollectiveRequest::Broadcast {
            root: 4,
            buffer: Buffer::zeros(DataType::U8, 1),
        };
        assert!(matches!(req.validate(0, 4), Err(CclError::InvalidArgument(_))));
        assert!(req.validate(0, 5).is_ok());
    }

    #[test]
    fn validate_rejects_layout_mismatch() {
        let req = CollectiveRequest::AllReduce {
            op: ReduceOp::Sum,
            input: Buffer::from_i32(&[1, 2, 3]),
            output: Buffer::zeros(DataType::I32, 2),
        };
        assert!(req.validate(0, 2).is_err());

        let req = CollectiveRequest::AllReduce {
            op: ReduceOp::Sum,
            input: Buffer::from_i32(&[1, 2]),
            output: Buffer::zeros(DataType::I64, 2),
        };
        assert!(req.validate(0, 2).is_err());
    }

    #[test]
    fn validate_all_gather_slots() {
        let ok = CollectiveRequest::AllGather {
            input: Buffer::from_i32(&[1, 2]),
            outputs: vec![Buffer::zeros(DataType::I32, 5), Buffer::zeros(DataType::I32, 2)],
        };
        // Slot 1 is ours and matches; slot 0 may be sized differently.
        assert!(ok.validate(1, 2).is_ok());
        assert!(ok.validate(0, 2).is_err());

        let short = CollectiveRequest::AllGather {
            input: Buffer::from_i32(&[1]),
            outputs: vec![Buffer::zeros(DataType::I32, 1)],
        };
        assert!(short.validate(0, 2).is_err());
    }

    #[test]
    fn validate_gather_and_scatter_by_role() {
        let gather = |rank_outputs: Vec<Buffer>| CollectiveRequest::Gather {
            root: 1,
            input: Buffer::from_f32(&[1.0, 2.0]),
            outputs: rank_outputs,
        };
        // Root needs one slot per rank; its own slot matches its input.
        let slots = vec![Buffer::zeros(DataType::F32, 3), Buffer::zeros(DataType::F32, 2)];
        assert!(gather(slots.clone()).validate(1, 2).is_ok());
        assert!(gather(slots[..1].to_vec()).validate(1, 2).is_err());
        // Everyone else passes none.
        assert!(gather(Vec::new()).validate(0, 2).is_ok());
        assert!(gather(slots).validate(0, 2).is_err());

        let scatter = CollectiveRequest::Scatter {
            root: 0,
            inputs: vec![Buffer::zeros(DataType::I32, 2), Buffer::zeros(DataType::I64, 2)],
            output: Buffer::zeros(DataType::I32, 2),
        };
        assert!(matches!(scatter.validate(0, 2), Err(CclError::InvalidArgument(_))));
    }

    #[test]
    fn validate_all_to_all_slots() {
        let req = CollectiveRequest::AllToAll {
            inputs: vec![Buffer::zeros(DataType::U8, 1), Buffer::zeros(DataType::U8, 4)],
            outputs: vec![Buffer::zeros(DataType::U8, 1), Buffer::zeros(DataType::U8, 2)],
        };
        // Rank 0 keeps its own slot: 1 element in, 1 out.
        assert!(req.validate(0, 2).is_ok());
        // Rank 1 would send itself 4 elements into a 2-element slot.
        assert!(req.validate(1, 2).is_err());
        assert!(req.validate(0, 3).is_err());
        assert_eq!(req.signature().to_string(), "all_to_all(0 x u8)");
    }
}
