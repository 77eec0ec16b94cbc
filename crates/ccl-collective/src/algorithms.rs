//! Fixed, deterministic collective algorithms.
//!
//! ```text
//! binomial tree, n = 8, root = 0 (relative ranks)
//!
//!            0
//!        ┌───┼─────┐
//!        1   2     4
//!            │   ┌─┴─┐
//!            3   5   6
//!                    │
//!                    7
//! ```
//!
//! Broadcast flows down the tree, reduce flows up it. Large all-reduces and
//! every all-gather use a ring instead: rank `r` sends to `r + 1` and receives
//! from `r - 1`, with each step's send and receive in flight together.
//! Gather and scatter are flat: the root talks to every rank at once.
//! All-to-all runs `n - 1` pairwise exchanges; at step `s` rank `r` sends to
//! `r + s` and receives from `r - s`.
//!
//! Every result is a pure function of the inputs, world size and config, so
//! all ranks agree bit for bit.

use futures::future::try_join_all;

use ccl_types::{Buffer, DataType, Rank, ReduceOp, Result};

use crate::engine::Comm;
use crate::reduce::combine;

// ── Tree shape ───────────────────────────────────────────────────────────────

/// Position of one rank in a binomial tree rooted at `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub parent: Option<Rank>,
    /// In ascending relative rank.
    pub children: Vec<Rank>,
}

fn lowbit(v: u32) -> u32 {
    v & v.wrapping_neg()
}

pub fn binomial_tree(rank: Rank, root: Rank, world_size: u32) -> TreeNode {
    let n = world_size;
    let v = (rank + n - root) % n;
    let absolute = |rel: u32| (rel + root) % n;

    let parent = (v != 0).then(|| absolute(v - lowbit(v)));

    // The root's subtree spans everything; others own [v, v + lowbit(v)).
    let span = if v == 0 { u32::MAX } else { lowbit(v) };
    let mut children = Vec::new();
    let mut k = 1u32;
    while k < span && v + k < n {
        children.push(absolute(v + k));
        k <<= 1;
    }

    TreeNode { parent, children }
}

/// Byte range of ring chunk `i` when `count` elements are split `n` ways:
/// elements `[i·count/n, (i+1)·count/n)`.
pub fn chunk_range(i: u32, n: u32, count: usize, element_bytes: usize) -> std::ops::Range<usize> {
    let bound = |i: u32| ((i as u64 * count as u64) / n as u64) as usize * element_bytes;
    bound(i)..bound(i + 1)
}

// ── Broadcast / reduce ───────────────────────────────────────────────────────

/// Receive `data` from the tree parent (unless root), then forward it to
/// every child concurrently.
pub(crate) async fn broadcast(comm: &Comm<'_>, root: Rank, step: u32, data: &mut [u8]) -> Result<()> {
    let node = binomial_tree(comm.rank(), root, comm.world_size());
    if let Some(parent) = node.parent {
        let received = comm.recv(parent, step, data.len()).await?;
        data.copy_from_slice(&received);
    }
    let data: &[u8] = data;
    try_join_all(node.children.iter().map(|&child| comm.send(child, step, data))).await?;
    Ok(())
}

/// Reduce `input` up the tree. Children's partials are combined in
/// ascending relative rank, then with the local value:
/// `acc = c1 ⊕ c2 ⊕ … ⊕ own`. Returns the result on `root` only.
pub(crate) async fn reduce(
    comm: &Comm<'_>,
    root: Rank,
    op: ReduceOp,
    dtype: DataType,
    step: u32,
    input: &[u8],
) -> Result<Option<Vec<u8>>> {
    let node = binomial_tree(comm.rank(), root, comm.world_size());

    let partials = try_join_all(
        node.children
            .iter()
            .map(|&child| comm.recv(child, step, input.len())),
    )
    .await?;

    let mut partials = partials.into_iter();
    let acc = match partials.next() {
        Some(mut acc) => {
            for partial in partials {
                combine(op, dtype, &mut acc, &partial)?;
            }
            combine(op, dtype, &mut acc, input)?;
            acc
        }
        None => input.to_vec(),
    };

    match node.parent {
        Some(parent) => {
            comm.send(parent, step, &acc).await?;
            Ok(None)
        }
        None => Ok(Some(acc)),
    }
}

// ── All-reduce ───────────────────────────────────────────────────────────────

/// Reduce to rank 0, then broadcast from rank 0.
pub(crate) async fn all_reduce_tree(
    comm: &Comm<'_>,
    op: ReduceOp,
    dtype: DataType,
    input: &[u8],
    output: &mut [u8],
) -> Result<()> {
    if let Some(acc) = reduce(comm, 0, op, dtype, 0, input).await? {
        output.copy_from_slice(&acc);
    }
    broadcast(comm, 0, 1, output).await
}

/// Ring reduce-scatter then ring all-gather over `data` in place. Steps
/// `0..n-1` scatter, steps `n-1..2n-2` gather.
pub(crate) async fn all_reduce_ring(
    comm: &Comm<'_>,
    op: ReduceOp,
    dtype: DataType,
    data: &mut [u8],
) -> Result<()> {
    let n = comm.world_size();
    let r = comm.rank();
    let next = (r + 1) % n;
    let prev = (r + n - 1) % n;
    let esize = dtype.element_bytes();
    let count = data.len() / esize;

    // After step s, chunk (r - s - 1) holds s + 2 contributions; rank r ends
    // up owning the full reduction of chunk (r + 1).
    for s in 0..n - 1 {
        let send = chunk_range((r + n - s) % n, n, count, esize);
        let recv = chunk_range((r + 2 * n - s - 1) % n, n, count, esize);

        let (_, mut partial) = tokio::try_join!(
            comm.send(next, s, &data[send]),
            comm.recv(prev, s, recv.len()),
        )?;
        combine(op, dtype, &mut partial, &data[recv.clone()])?;
        data[recv].copy_from_slice(&partial);
    }

    for s in 0..n - 1 {
        let send = chunk_range((r + 1 + n - s) % n, n, count, esize);
        let recv = chunk_range((r + n - s) % n, n, count, esize);
        let step = n - 1 + s;

        let (_, reduced) = tokio::try_join!(
            comm.send(next, step, &data[send]),
            comm.recv(prev, step, recv.len()),
        )?;
        data[recv].copy_from_slice(&reduced);
    }
    Ok(())
}

// ── All-gather ───────────────────────────────────────────────────────────────

/// `outputs[rank]` must already hold the local input. At step `s` rank `r`
/// forwards slot `r - s` and receives slot `r - s - 1`.
pub(crate) async fn all_gather_ring(comm: &Comm<'_>, outputs: &mut [Buffer]) -> Result<()> {
    let n = comm.world_size();
    let r = comm.rank();
    let next = (r + 1) % n;
    let prev = (r + n - 1) % n;

    for s in 0..n - 1 {
        let send = ((r + n - s) % n) as usize;
        let recv = ((r + 2 * n - s - 1) % n) as usize;
        let expected = outputs[recv].len_bytes();

        let (_, slot) = tokio::try_join!(
            comm.send(next, s, outputs[send].as_bytes()),
            comm.recv(prev, s, expected),
        )?;
        outputs[recv].as_bytes_mut().copy_from_slice(&slot);
    }
    Ok(())
}

// ── Gather / scatter / all-to-all ────────────────────────────────────────────

/// Non-root ranks send `input` to `root`, which receives every contribution
/// concurrently. Root's own slot must already be filled.
pub(crate) async fn gather(comm: &Comm<'_>, root: Rank, input: &[u8], outputs: &mut [Buffer]) -> Result<()> {
    if comm.rank() != root {
        return comm.send(root, 0, input).await;
    }
    let expected: Vec<usize> = outputs.iter().map(Buffer::len_bytes).collect();
    let received = try_join_all(
        (0..comm.world_size())
            .filter(|&r| r != root)
            .map(|r| {
                let len = expected[r as usize];
                async move { comm.recv(r, 0, len).await.map(|data| (r, data)) }
            }),
    )
    .await?;
    for (r, data) in received {
        outputs[r as usize].as_bytes_mut().copy_from_slice(&data);
    }
    Ok(())
}

/// Root sends `inputs[i]` to every rank `i` concurrently; the others receive
/// into `output`. Root's own `output` must already be filled.
pub(crate) async fn scatter(comm: &Comm<'_>, root: Rank, inputs: &[Buffer], output: &mut [u8]) -> Result<()> {
    if comm.rank() != root {
        let received = comm.recv(root, 0, output.len()).await?;
        output.copy_from_slice(&received);
        return Ok(());
    }
    try_join_all(
        (0..comm.world_size())
            .filter(|&r| r != root)
            .map(|r| comm.send(r, 0, inputs[r as usize].as_bytes())),
    )
    .await?;
    Ok(())
}

/// `outputs[rank]` must already hold `inputs[rank]`.
pub(crate) async fn all_to_all(comm: &Comm<'_>, inputs: &[Buffer], outputs: &mut [Buffer]) -> Result<()> {
    let n = comm.world_size();
    let r = comm.rank();
    for s in 1..n {
        let to = (r + s) % n;
        let from = (r + n - s) % n;
        let expected = outputs[from as usize].len_bytes();

        let (_, received) = tokio::try_join!(
            comm.send(to, s, inputs[to as usize].as_bytes()),
            comm.recv(from, s, expected),
        )?;
        outputs[from as usize].as_bytes_mut().copy_from_slice(&received);
    }
    Ok(())
}

// ── Barrier ──────────────────────────────────────────────────────────────────

pub(crate) async fn barrier(comm: &Comm<'_>) -> Result<()> {
    reduce(comm, 0, ReduceOp::Sum, DataType::U8, 0, &[]).await?;
    broadcast(comm, 0, 1, &mut []).await
}
