// ccl-net::link: one reliable, ordered, bidirectional byte channel to a peer.
//
// A `Link` owns two background tasks:
//   reader: decodes frames, queues data for `recv`, reports control frames
//            and failures as `LinkEvent`s
//   writer: drains the outbound queue onto the stream, acking blocking sends
//
// Frames from one sender arrive in the order they were sent; there is no
// ordering across different peers.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use ccl_types::wire::{FrameHeader, PeerControl, PeerMessage};
use ccl_types::{CclError, Rank, Result};

use crate::codec;
use crate::events::LinkEvent;

/// Data frames buffered ahead of the collective engine.
const INBOUND_CAPACITY: usize = 64;

/// Frames queued for the writer task.
const OUTBOUND_CAPACITY: usize = 64;

/// How long `close` waits for the goodbye frame to flush.
const GOODBYE_TIMEOUT: Duration = Duration::from_millis(500);

/// A data frame received from the peer.
#[derive(Debug)]
pub struct Inbound {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

struct Outbound {
    frame: Vec<u8>,
    ack: Option<oneshot::Sender<io::Result<()>>>,
}

// ── Link ──────────────────────────────────────────────────────────────────────

pub struct Link {
    peer: Rank,
    outbound: mpsc::Sender<Outbound>,
    inbound: Mutex<mpsc::Receiver<Inbound>>,
    cancel: CancellationToken,
}

impl Link {
    /// Take ownership of an established stream and start its reader and
    /// writer tasks. Failures are reported on `events`.
    pub fn spawn<S>(
        peer: Rank,
        stream: S,
        events: mpsc::UnboundedSender<LinkEvent>,
        max_frame_bytes: usize,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(stream);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        tokio::spawn(reader_loop(
            peer,
            rd,
            in_tx,
            events.clone(),
            cancel.clone(),
            max_frame_bytes,
        ));
        tokio::spawn(writer_loop(peer, wr, out_rx, events, cancel.clone()));

        Arc::new(Self {
            peer,
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            cancel,
        })
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }

    // ── Send ────────────────────────────────────────────────────────────

    /// Queue an encoded frame and wait until it has been written to the
    /// stream.
    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send(Outbound { frame, ack: Some(ack_tx) })
            .await
            .map_err(|_| self.closed_error())?;

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CclError::transport(
                Some(self.peer),
                format!("send to rank {} failed: {e}", self.peer),
            )),
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Queue an encoded frame without waiting. Write failures surface as a
    /// `LinkEvent::Down`.
    pub fn try_send(&self, frame: Vec<u8>) -> Result<()> {
        self.outbound
            .try_send(Outbound { frame, ack: None })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CclError::transport(
                    Some(self.peer),
                    format!("outbound queue to rank {} is full", self.peer),
                ),
                mpsc::error::TrySendError::Closed(_) => self.closed_error(),
            })
    }

    pub async fn send_data(&self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        self.send(codec::encode_data(header, payload)?).await
    }

    pub async fn send_control(&self, msg: &PeerControl) -> Result<()> {
        self.send(codec::encode_control(msg)?).await
    }

    // ── Receive ─────────────────────────────────────────────────────────

    /// Next data frame from the peer. Cancel-safe.
    pub async fn recv(&self) -> Result<Inbound> {
        let mut rx = self.inbound.lock().await;
        rx.recv().await.ok_or_else(|| self.closed_error())
    }

    /// Next data frame if one is already buffered.
    pub fn try_recv(&self) -> Result<Option<Inbound>> {
        let mut rx = self.inbound.try_lock().map_err(|_| {
            CclError::transport(Some(self.peer), "a receive is already in progress")
        })?;
        match rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(self.closed_error()),
        }
    }

    /// Receive the next data frame into `buf`, returning its header and the
    /// number of bytes written. Fails without touching `buf` if the payload
    /// does not fit.
    pub async fn recv_into(&self, buf: &mut [u8]) -> Result<(FrameHeader, usize)> {
        let Inbound { header, payload } = self.recv().await?;
        if payload.len() > buf.len() {
            return Err(CclError::transport(
                Some(self.peer),
                format!(
                    "rank {} sent {} bytes into a {}-byte buffer",
                    self.peer,
                    payload.len(),
                    buf.len()
                ),
            ));
        }
        buf[..payload.len()].copy_from_slice(&payload);
        Ok((header, payload.len()))
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Send a goodbye (best effort) and stop both tasks.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Ok(frame) = codec::encode_control(&PeerControl::Goodbye) {
            let _ = tokio::time::timeout(GOODBYE_TIMEOUT, self.send(frame)).await;
        }
        self.cancel.cancel();
    }

    /// Stop both tasks immediately without notifying the peer.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    fn closed_error(&self) -> CclError {
        CclError::transport(
            Some(self.peer),
            format!("link to rank {} is closed", self.peer),
        )
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Background tasks ─────────────────────────────────────────────────────────

async fn reader_loop<R>(
    peer: Rank,
    mut io: R,
    inbound: mpsc::Sender<Inbound>,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = codec::read_length_prefixed(&mut io, max_frame_bytes) => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                let reason = if e.kind() == io::ErrorKind::UnexpectedEof {
                    "connection closed by peer".to_string()
                } else {
                    e.to_string()
                };
                debug!(peer, %reason, "link reader stopped");
                let _ = events.send(LinkEvent::Down { peer, reason });
                return;
            }
        };

        match codec::decode_peer_message(frame) {
            Ok(PeerMessage::Data { header, payload }) => {
                trace!(peer, seq = header.seq, step = header.step, bytes = payload.len(), "data frame");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = inbound.send(Inbound { header, payload }) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(PeerMessage::Control(PeerControl::Abort { seq, failed_peer, reason })) => {
                debug!(peer, seq, ?failed_peer, %reason, "peer aborted collective");
                let _ = events.send(LinkEvent::Abort { peer, seq, failed_peer, reason });
            }
            Ok(PeerMessage::Control(PeerControl::StatusQuery { seq })) => {
                trace!(peer, seq, "status query");
                let _ = events.send(LinkEvent::StatusQuery { peer, seq });
            }
            Ok(PeerMessage::Control(PeerControl::StatusReply { seq, progress })) => {
                trace!(peer, seq, ?progress, "status reply");
                let _ = events.send(LinkEvent::StatusReply { peer, seq, progress });
            }
            Ok(PeerMessage::Control(PeerControl::Goodbye)) => {
                debug!(peer, "peer said goodbye");
                let _ = events.send(LinkEvent::Closed { peer });
                return;
            }
            Ok(PeerMessage::Control(PeerControl::Hello { rank, .. })) => {
                warn!(peer, rank, "ignoring hello on an established link");
            }
            Err(e) => {
                let _ = events.send(LinkEvent::Down {
                    peer,
                    reason: format!("undecodable frame: {e}"),
                });
                return;
            }
        }
    }
}

async fn writer_loop<W>(
    peer: Rank,
    mut io: W,
    mut outbound: mpsc::Receiver<Outbound>,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => next,
        };
        let Some(Outbound { frame, ack }) = next else {
            break;
        };

        let result = codec::write_length_prefixed(&mut io, &frame).await;
        let failure = result.as_ref().err().map(|e| e.to_string());
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
        if let Some(reason) = failure {
            debug!(peer, %reason, "link writer stopped");
            let _ = events.send(LinkEvent::Down { peer, reason });
            break;
        }
    }
    let _ = io.shutdown().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ccl_types::{CollectiveKind, CollectiveSignature};

    fn pair() -> (
        Arc<Link>,
        Arc<Link>,
        mpsc::UnboundedReceiver<LinkEvent>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ev_a_tx, ev_a) = mpsc::unbounded_channel();
        let (ev_b_tx, ev_b) = mpsc::unbounded_channel();
        let link_a = Link::spawn(1, a, ev_a_tx, codec::DEFAULT_MAX_FRAME_BYTES);
        let link_b = Link::spawn(0, b, ev_b_tx, codec::DEFAULT_MAX_FRAME_BYTES);
        (link_a, link_b, ev_a, ev_b)
    }

    fn header(seq: u64) -> FrameHeader {
        FrameHeader {
            seq,
            step: 0,
            chunk: 0,
            signature: CollectiveSignature {
                kind: CollectiveKind::Broadcast,
                dtype: None,
                count: 0,
                root: Some(0),
                op: None,
            },
        }
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (a, b, _ea, _eb) = pair();
        for seq in 0..10u64 {
            a.send_data(&header(seq), &seq.to_le_bytes()).await.unwrap();
        }
        for seq in 0..10u64 {
            let msg = b.recv().await.unwrap();
            assert_eq!(msg.header.seq, seq);
            assert_eq!(msg.payload, seq.to_le_bytes());
        }
    }

    #[tokio::test]
    async fn try_send_and_recv_into() {
        let (a, b, _ea, _eb) = pair();
        assert!(b.try_recv().unwrap().is_none());

        a.try_send(codec::encode_data(&header(7), &[1, 2, 3]).unwrap()).unwrap();
        let mut buf = [0u8; 8];
        let (hdr, n) = b.recv_into(&mut buf).await.unwrap();
        assert_eq!(hdr.seq, 7);
        assert_eq!(&buf[..n], &[1, 2, 3]);

        a.send_data(&header(8), &[0u8; 16]).await.unwrap();
        assert!(b.recv_into(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn close_notifies_peer() {
        let (a, b, _ea, mut eb) = pair();
        a.close().await;
        assert!(a.is_closed());
        assert_eq!(eb.recv().await.unwrap(), LinkEvent::Closed { peer: 0 });

        // The peer's reader has stopped, so receives now fail.
        let err = b.recv().await.unwrap_err();
        assert_eq!(err.peer(), Some(0));
    }

    #[tokio::test]
    async fn abort_frame_becomes_event() {
        let (a, _b, _ea, mut eb) = pair();
        a.send_control(&PeerControl::Abort {
            seq: 4,
            failed_peer: Some(2),
            reason: "rank 2 unreachable".into(),
        })
        .await
        .unwrap();

        match eb.recv().await.unwrap() {
            LinkEvent::Abort { peer, seq, failed_peer, .. } => {
                assert_eq!(peer, 0);
                assert_eq!(seq, 4);
                assert_eq!(failed_peer, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_frames_become_events() {
        let (a, b, mut ea, mut eb) = pair();
        a.send_control(&PeerControl::StatusQuery { seq: 6 }).await.unwrap();
        assert_eq!(eb.recv().await.unwrap(), LinkEvent::StatusQuery { peer: 0, seq: 6 });

        let progress = ccl_types::wire::PeerProgress::Idle { next_seq: 6 };
        b.send_control(&PeerControl::StatusReply { seq: 6, progress }).await.unwrap();
        assert_eq!(ea.recv().await.unwrap(), LinkEvent::StatusReply { peer: 1, seq: 6, progress });
    }

    #[tokio::test]
    async fn dropped_stream_reports_down() {
        let (a, b) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = Link::spawn(3, a, tx, codec::DEFAULT_MAX_FRAME_BYTES);
        drop(b);

        match rx.recv().await.unwrap() {
            LinkEvent::Down { peer, .. } => assert_eq!(peer, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert!(link.recv().await.is_err());
    }
}
