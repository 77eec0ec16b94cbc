//! Executes one collective at a time over a group's links.
//!
//! Each collective gets the next group-wide sequence number. Every data
//! frame carries `{ seq, step, chunk, signature }`; a receiver rejects frames
//! from another round, and with signature checking on, frames from a
//! different collective. Payloads larger than the link's frame limit travel
//! as several chunks of one step.
//!
//! On any failure the engine records a group fault and tells every peer
//! with a best-effort `Abort`, so all live ranks converge on the same
//! `failed_peer`. A receive that times out first queries the peer it waits
//! on (see [`crate::liveness`]) and only blames a peer that is not taking
//! part in the collective.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ccl_net::{codec, Inbound, Link, LinkSet};
use ccl_types::wire::{FrameHeader, PeerControl, PeerProgress};
use ccl_types::{
    CclError, CollectiveOutput, CollectiveRequest, CollectiveSignature, GroupOptions, Rank, Result,
};

use crate::algorithms;
use crate::fault::{Fault, FaultSignal};
use crate::liveness::Liveness;

/// Upper bound on how long a timed-out receive waits for a status reply.
const MAX_QUERY_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub op_timeout: Duration,
    pub ring_threshold_bytes: usize,
    pub verify_signatures: bool,
    pub max_frame_bytes: usize,
}

impl From<&GroupOptions> for EngineConfig {
    fn from(opts: &GroupOptions) -> Self {
        Self {
            op_timeout: opts.op_timeout,
            ring_threshold_bytes: opts.ring_threshold_bytes,
            verify_signatures: opts.verify_signatures,
            max_frame_bytes: opts.max_frame_bytes,
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct CollectiveEngine {
    rank: Rank,
    world_size: u32,
    links: Arc<LinkSet>,
    fault: FaultSignal,
    liveness: Arc<Liveness>,
    config: EngineConfig,
    transport_available: bool,
    next_seq: u64,
}

impl CollectiveEngine {
    pub fn new(
        links: Arc<LinkSet>,
        fault: FaultSignal,
        liveness: Arc<Liveness>,
        config: EngineConfig,
        transport_available: bool,
    ) -> Self {
        Self {
            rank: links.rank(),
            world_size: links.world_size(),
            links,
            fault,
            liveness,
            config,
            transport_available,
            next_seq: 0,
        }
    }

    /// Sequence number the next collective will use.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Run `request` to completion. Fails fast on a faulted group; any
    /// failure during the run faults the group.
    pub async fn execute(
        &mut self,
        request: CollectiveRequest,
        cancel: &CancellationToken,
    ) -> Result<CollectiveOutput> {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.liveness.set(PeerProgress::Running { seq });
        let result = self.execute_seq(seq, request, cancel).await;
        self.liveness.set(PeerProgress::Idle { next_seq: self.next_seq });
        result
    }

    async fn execute_seq(
        &self,
        seq: u64,
        request: CollectiveRequest,
        cancel: &CancellationToken,
    ) -> Result<CollectiveOutput> {
        if let Some(fault) = self.fault.current() {
            return Err(fault.to_error());
        }
        request.validate(self.rank, self.world_size)?;

        if self.world_size == 1 {
            return run_local(request);
        }
        if !self.transport_available {
            let err = CclError::transport(None, "no transport provider is available");
            self.fault.record(Fault::new(err.to_string(), None));
            return Err(err);
        }

        let signature = request.signature();
        let comm = Comm {
            rank: self.rank,
            world_size: self.world_size,
            seq,
            signature,
            links: &self.links,
            fault: &self.fault,
            liveness: &self.liveness,
            config: &self.config,
        };

        let started = Instant::now();
        debug!(rank = self.rank, seq, %signature, "collective started");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(CclError::collective(format!("collective #{seq} cancelled"), None))
            }
            result = run(&comm, request) => result,
        };

        match result {
            Ok(output) => {
                debug!(rank = self.rank, seq, elapsed = ?started.elapsed(), "collective completed");
                Ok(output)
            }
            Err(err) => Err(self.abort(seq, err, cancel.is_cancelled())),
        }
    }

    /// Record the failure and notify every peer. Returns the error to hand
    /// back to the caller: the group's first fault, unless this rank
    /// detected a signature mismatch itself.
    ///
    /// A cancelled handle has already recorded its own fault, so peers are
    /// told about cancellation regardless of who set the fault.
    fn abort(&self, seq: u64, err: CclError, cancelled: bool) -> CclError {
        let err = match err {
            mismatch @ CclError::MismatchedCollective { .. } => mismatch,
            other => other.into_collective(),
        };
        let failed_peer = err.peer();
        let reason = err.to_string();
        warn!(rank = self.rank, seq, ?failed_peer, %reason, "collective aborted");

        let first = self.fault.record(Fault::new(reason.clone(), failed_peer));
        if first || cancelled {
            let frame = codec::encode_control(&PeerControl::Abort { seq, failed_peer, reason });
            if let Ok(frame) = frame {
                for link in self.links.links() {
                    if let Err(e) = link.try_send(frame.clone()) {
                        debug!(rank = self.rank, peer = link.peer(), %e, "abort not delivered");
                    }
                }
            }
        }
        if first {
            return err;
        }

        match (&err, self.fault.current()) {
            (CclError::MismatchedCollective { .. }, _) | (_, None) => err,
            (_, Some(first)) => first.to_error(),
        }
    }
}

fn run_local(request: CollectiveRequest) -> Result<CollectiveOutput> {
    Ok(match request {
        CollectiveRequest::Broadcast { buffer, .. } => CollectiveOutput::Broadcast { buffer },
        CollectiveRequest::Reduce { input, mut output, .. } => {
            output.copy_from(&input)?;
            CollectiveOutput::Reduce { input, output }
        }
        CollectiveRequest::AllReduce { input, mut output, .. } => {
            output.copy_from(&input)?;
            CollectiveOutput::AllReduce { input, output }
        }
        CollectiveRequest::AllGather { input, mut outputs } => {
            outputs[0].copy_from(&input)?;
            CollectiveOutput::AllGather { input, outputs }
        }
        CollectiveRequest::Gather { input, mut outputs, .. } => {
            outputs[0].copy_from(&input)?;
            CollectiveOutput::Gather { input, outputs }
        }
        CollectiveRequest::Scatter { inputs, mut output, .. } => {
            output.copy_from(&inputs[0])?;
            CollectiveOutput::Scatter { inputs, output }
        }
        CollectiveRequest::AllToAll { inputs, mut outputs } => {
            outputs[0].copy_from(&inputs[0])?;
            CollectiveOutput::AllToAll { inputs, outputs }
        }
        CollectiveRequest::Barrier => CollectiveOutput::Barrier,
    })
}

async fn run(comm: &Comm<'_>, request: CollectiveRequest) -> Result<CollectiveOutput> {
    let rank = comm.rank as usize;
    match request {
        CollectiveRequest::Broadcast { root, mut buffer } => {
            algorithms::broadcast(comm, root, 0, buffer.as_bytes_mut()).await?;
            Ok(CollectiveOutput::Broadcast { buffer })
        }
        CollectiveRequest::Reduce { root, op, input, mut output } => {
            let reduced = algorithms::reduce(comm, root, op, input.dtype(), 0, input.as_bytes()).await?;
            if let Some(acc) = reduced {
                output.as_bytes_mut().copy_from_slice(&acc);
            }
            Ok(CollectiveOutput::Reduce { input, output })
        }
        CollectiveRequest::AllReduce { op, input, mut output } => {
            let dtype = input.dtype();
            if input.len_bytes() < comm.config.ring_threshold_bytes {
                algorithms::all_reduce_tree(comm, op, dtype, input.as_bytes(), output.as_bytes_mut())
                    .await?;
            } else {
                output.copy_from(&input)?;
                algorithms::all_reduce_ring(comm, op, dtype, output.as_bytes_mut()).await?;
            }
            Ok(CollectiveOutput::AllReduce { input, output })
        }
        CollectiveRequest::AllGather { input, mut outputs } => {
            outputs[rank].copy_from(&input)?;
            algorithms::all_gather_ring(comm, &mut outputs).await?;
            Ok(CollectiveOutput::AllGather { input, outputs })
        }
        CollectiveRequest::Gather { root, input, mut outputs } => {
            if comm.rank == root {
                outputs[rank].copy_from(&input)?;
            }
            algorithms::gather(comm, root, input.as_bytes(), &mut outputs).await?;
            Ok(CollectiveOutput::Gather { input, outputs })
        }
        CollectiveRequest::Scatter { root, inputs, mut output } => {
            if comm.rank == root {
                output.copy_from(&inputs[rank])?;
            }
            algorithms::scatter(comm, root, &inputs, output.as_bytes_mut()).await?;
            Ok(CollectiveOutput::Scatter { inputs, output })
        }
        CollectiveRequest::AllToAll { inputs, mut outputs } => {
            outputs[rank].copy_from(&inputs[rank])?;
            algorithms::all_to_all(comm, &inputs, &mut outputs).await?;
            Ok(CollectiveOutput::AllToAll { inputs, outputs })
        }
        CollectiveRequest::Barrier => {
            algorithms::barrier(comm).await?;
            Ok(CollectiveOutput::Barrier)
        }
    }
}

// ── Per-collective messaging ─────────────────────────────────────────────────

/// Point-to-point operations scoped to one collective round.
pub(crate) struct Comm<'a> {
    rank: Rank,
    world_size: u32,
    seq: u64,
    signature: CollectiveSignature,
    links: &'a LinkSet,
    fault: &'a FaultSignal,
    liveness: &'a Liveness,
    config: &'a EngineConfig,
}

impl Comm<'_> {
    pub(crate) fn rank(&self) -> Rank {
        self.rank
    }

    pub(crate) fn world_size(&self) -> u32 {
        self.world_size
    }

    fn header(&self, step: u32, chunk: u32) -> FrameHeader {
        FrameHeader {
            seq: self.seq,
            step,
            chunk,
            signature: self.signature,
        }
    }

    /// Send `payload` to `peer` as one or more frames of `step`.
    pub(crate) async fn send(&self, peer: Rank, step: u32, payload: &[u8]) -> Result<()> {
        let link = self.links.get(peer)?;
        let chunk_bytes = codec::max_data_payload(self.config.max_frame_bytes);
        // An empty payload still travels as one frame.
        let parts: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(chunk_bytes).collect()
        };

        for (chunk, part) in parts.into_iter().enumerate() {
            let header = self.header(step, chunk as u32);
            tokio::select! {
                biased;
                sent = link.send_data(&header, part) => sent?,
                fault = self.fault.wait() => return Err(fault.to_error()),
                _ = tokio::time::sleep(self.config.op_timeout) => return Err(CclError::collective(
                    format!(
                        "send to rank {peer} stalled for {:?} in collective #{}",
                        self.config.op_timeout, self.seq
                    ),
                    Some(peer),
                )),
            }
        }
        Ok(())
    }

    /// Receive exactly `expected_len` bytes of `step` from `peer`, gathering
    /// chunks in order.
    pub(crate) async fn recv(&self, peer: Rank, step: u32, expected_len: usize) -> Result<Vec<u8>> {
        let link = self.links.get(peer)?;
        let mut data: Vec<u8> = Vec::new();
        let mut chunk = 0u32;
        loop {
            let inbound = self.next_frame(link).await?;
            let payload = self.check(peer, step, chunk, inbound)?;
            let received = data.len() + payload.len();
            if chunk == 0 && received == expected_len {
                return Ok(payload);
            }
            if received > expected_len || payload.is_empty() {
                return Err(CclError::collective(
                    format!("rank {peer} sent {received} bytes, expected {expected_len}"),
                    Some(peer),
                ));
            }
            if chunk == 0 {
                data.reserve_exact(expected_len);
            }
            data.extend_from_slice(&payload);
            if data.len() == expected_len {
                return Ok(data);
            }
            chunk += 1;
        }
    }

    /// Next data frame from `link`. After `op_timeout` of silence the peer is
    /// queried: one still engaged in this collective earns a second
    /// `op_timeout`, during which the culprit's abort normally arrives.
    async fn next_frame(&self, link: &Link) -> Result<Inbound> {
        let mut extended = false;
        loop {
            tokio::select! {
                biased;
                msg = link.recv() => return msg,
                fault = self.fault.wait() => return Err(fault.to_error()),
                _ = tokio::time::sleep(self.config.op_timeout) => {}
            }
            if extended || !self.peer_is_engaged(link).await {
                return Err(self.stalled(link.peer()));
            }
            debug!(rank = self.rank, peer = link.peer(), seq = self.seq, "peer is blocked too, waiting for an abort");
            extended = true;
        }
    }

    async fn peer_is_engaged(&self, link: &Link) -> bool {
        let wait = (self.config.op_timeout / 10).min(MAX_QUERY_WAIT);
        match self.liveness.query(link, self.seq, wait).await {
            Some(progress) => {
                debug!(rank = self.rank, peer = link.peer(), seq = self.seq, ?progress, "status answered");
                progress.is_engaged(self.seq)
            }
            None => false,
        }
    }

    fn stalled(&self, peer: Rank) -> CclError {
        CclError::collective(
            format!(
                "rank {peer} sent nothing for {:?} in collective #{}",
                self.config.op_timeout, self.seq
            ),
            Some(peer),
        )
    }

    fn check(&self, peer: Rank, step: u32, chunk: u32, inbound: Inbound) -> Result<Vec<u8>> {
        let Inbound { header, payload } = inbound;
        if header.seq != self.seq {
            return Err(CclError::collective(
                format!(
                    "rank {peer} sent a frame of collective #{} during #{}",
                    header.seq, self.seq
                ),
                Some(peer),
            ));
        }
        if self.config.verify_signatures && header.signature != self.signature {
            return Err(CclError::MismatchedCollective {
                peer,
                expected: self.signature.to_string(),
                actual: header.signature.to_string(),
            });
        }
        if header.step != step || header.chunk != chunk {
            return Err(CclError::collective(
                format!(
                    "rank {peer} sent step {}.{} of collective #{}, expected step {step}.{chunk}",
                    header.step, header.chunk, self.seq
                ),
                Some(peer),
            ));
        }
        Ok(payload)
    }
}
