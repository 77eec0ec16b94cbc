//! Collective workloads: `op,size,root` lines replayed for a number of
//! rounds against a process group, with per-line timing.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use half::{bf16, f16};
use serde::Serialize;
use tracing::{debug, info};

use ccl_collective::ProcessGroup;
use ccl_types::{Buffer, CollectiveKind, DataType, Rank, ReduceOp};

// ── Parsing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadItem {
    pub kind: CollectiveKind,
    /// Element count per rank, or per destination for scatter and all-to-all.
    pub size: usize,
    pub root: Rank,
}

/// Parse `op,size,root` lines. Blank lines and `#` comments are skipped;
/// every root must be a valid rank of a `world_size` group.
pub fn parse(text: &str, world_size: u32) -> Result<Vec<WorkloadItem>> {
    let mut items = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [op, size, root] = fields.as_slice() else {
            bail!("line {}: expected op,size,root but got '{line}'", lineno + 1);
        };
        let kind: CollectiveKind = op.parse().with_context(|| format!("line {}", lineno + 1))?;
        let size: usize = size
            .parse()
            .with_context(|| format!("line {}: bad size '{size}'", lineno + 1))?;
        let root: Rank = root
            .parse()
            .with_context(|| format!("line {}: bad root '{root}'", lineno + 1))?;
        if root >= world_size {
            bail!("line {}: invalid root {root} for world size {world_size}", lineno + 1);
        }
        items.push(WorkloadItem { kind, size, root });
    }
    Ok(items)
}

pub fn load(path: &Path, world_size: u32) -> Result<Vec<WorkloadItem>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading workload {}", path.display()))?;
    parse(&text, world_size)
}

/// Used when no workload file is given.
pub fn default_workload() -> Vec<WorkloadItem> {
    [
        (CollectiveKind::AllReduce, 1024, 0),
        (CollectiveKind::AllReduce, 1 << 20, 0),
        (CollectiveKind::Broadcast, 4096, 0),
        (CollectiveKind::Reduce, 4096, 0),
        (CollectiveKind::AllGather, 1024, 0),
        (CollectiveKind::Gather, 1024, 0),
        (CollectiveKind::Scatter, 1024, 0),
        (CollectiveKind::AllToAll, 256, 0),
        (CollectiveKind::Barrier, 0, 0),
    ]
    .into_iter()
    .map(|(kind, size, root)| WorkloadItem { kind, size, root })
    .collect()
}

// ── Inputs ───────────────────────────────────────────────────────────────────

/// Deterministic per-rank input in `[0, 1)` (integers: `[0, 100)`).
pub fn make_input(dtype: DataType, count: usize, rank: Rank) -> Buffer {
    let values = (0..count).map(|i| ((i * 31 + rank as usize * 17) % 97) as f64 / 97.0);
    match dtype {
        DataType::U8 => Buffer::from_u8(&values.map(|v| (v * 100.0) as u8).collect::<Vec<_>>()),
        DataType::I8 => Buffer::from_i8(&values.map(|v| (v * 100.0) as i8).collect::<Vec<_>>()),
        DataType::I32 => Buffer::from_i32(&values.map(|v| (v * 100.0) as i32).collect::<Vec<_>>()),
        DataType::I64 => Buffer::from_i64(&values.map(|v| (v * 100.0) as i64).collect::<Vec<_>>()),
        DataType::F16 => Buffer::from_f16(&values.map(f16::from_f64).collect::<Vec<_>>()),
        DataType::BF16 => Buffer::from_bf16(&values.map(bf16::from_f64).collect::<Vec<_>>()),
        DataType::F32 => Buffer::from_f32(&values.map(|v| v as f32).collect::<Vec<_>>()),
        DataType::F64 => Buffer::from_f64(&values.collect::<Vec<_>>()),
    }
}

// ── Execution ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct OpReport {
    pub op: String,
    pub size: usize,
    pub root: Rank,
    pub bytes: usize,
    pub rounds: u32,
    pub total_ms: f64,
    pub mean_ms: f64,
}

/// Replay `items` for `rounds` rounds. Returns one report per item and the
/// last all-reduce output, for cross-rank comparison.
pub async fn execute(
    group: &ProcessGroup,
    items: &[WorkloadItem],
    rounds: u32,
    dtype: DataType,
) -> Result<(Vec<OpReport>, Option<Buffer>)> {
    let rank = group.rank();
    let world_size = group.world_size() as usize;
    let inputs: Vec<Buffer> = items.iter().map(|it| make_input(dtype, it.size, rank)).collect();
    let mut elapsed = vec![Duration::ZERO; items.len()];
    let mut last_all_reduce = None;

    info!(rank, items = items.len(), rounds, %dtype, "workload starting");
    for round in 0..rounds {
        for (i, item) in items.iter().enumerate() {
            let input = inputs[i].clone();
            let started = Instant::now();
            match item.kind {
                CollectiveKind::Broadcast => {
                    group.broadcast(item.root, input).await?;
                }
                CollectiveKind::Reduce => {
                    let output = Buffer::zeros(dtype, item.size);
                    group.reduce(item.root, ReduceOp::Sum, input, output).await?;
                }
                CollectiveKind::AllReduce => {
                    let output = Buffer::zeros(dtype, item.size);
                    last_all_reduce = Some(group.all_reduce(ReduceOp::Sum, input, output).await?);
                }
                CollectiveKind::AllGather => {
                    let outputs = (0..world_size).map(|_| Buffer::zeros(dtype, item.size)).collect();
                    group.all_gather(input, outputs).await?;
                }
                CollectiveKind::Gather => {
                    let outputs = if rank == item.root {
                        (0..world_size).map(|_| Buffer::zeros(dtype, item.size)).collect()
                    } else {
                        Vec::new()
                    };
                    group.gather(item.root, input, outputs).await?;
                }
                CollectiveKind::Scatter => {
                    let inputs = if rank == item.root {
                        (0..world_size).map(|_| input.clone()).collect()
                    } else {
                        Vec::new()
                    };
                    group.scatter(item.root, inputs, Buffer::zeros(dtype, item.size)).await?;
                }
                CollectiveKind::AllToAll => {
                    let inputs = (0..world_size).map(|_| input.clone()).collect();
                    let outputs = (0..world_size).map(|_| Buffer::zeros(dtype, item.size)).collect();
                    group.all_to_all(inputs, outputs).await?;
                }
                CollectiveKind::Barrier => group.barrier().await?,
            }
            elapsed[i] += started.elapsed();
            debug!(rank, round, op = %item.kind, size = item.size, "op done");
        }
    }

    let reports = items
        .iter()
        .zip(elapsed)
        .map(|(item, total)| {
            let total_ms = total.as_secs_f64() * 1e3;
            OpReport {
                op: item.kind.to_string(),
                size: item.size,
                root: item.root,
                bytes: item.size * dtype.element_bytes(),
                rounds,
                total_ms,
                mean_ms: if rounds == 0 { 0.0 } else { total_ms / rounds as f64 },
            }
        })
        .collect();
    Ok((reports, last_all_reduce))
}
