// ccl-net::codec: framing for rendezvous and peer links.
//
// Every frame on the wire is `[u32 big-endian length][body]`.
//
// Peer frame bodies start with a one-byte kind:
//   0 = control : [bincode PeerControl]
//   1 = data    : [u32 BE header length][bincode FrameHeader][raw payload]
//
// Data payloads are appended raw after the header so a multi-megabyte
// tensor slice is never run through the serializer.
//
// Rendezvous frame bodies are a bare bincode `RendezvousMessage`.

use std::io;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use ccl_types::wire::{FrameHeader, PeerControl, PeerMessage, RendezvousMessage};
use ccl_types::{CclError, Result};

/// Reject any single frame larger than 256 MiB unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Rendezvous messages are tiny; cap them well below the data limit.
const MAX_RENDEZVOUS_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Bytes a data frame spends on its kind byte, header length and encoded
/// `FrameHeader`, rounded up.
pub const DATA_FRAME_OVERHEAD: usize = 64;

const KIND_CONTROL: u8 = 0;
const KIND_DATA: u8 = 1;

// ── Bincode ──────────────────────────────────────────────────────────────────

/// Serialize to bincode using the workspace-standard config.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CclError::Serialization(e.to_string()))
}

/// Deserialize from bincode.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CclError::Serialization(e.to_string()))?;
    Ok(value)
}

// ── Peer frames ──────────────────────────────────────────────────────────────

pub fn encode_control(msg: &PeerControl) -> Result<Vec<u8>> {
    let body = encode(msg)?;
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(KIND_CONTROL);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Largest payload that fits one data frame under `max_frame_bytes`.
pub fn max_data_payload(max_frame_bytes: usize) -> usize {
    max_frame_bytes.saturating_sub(DATA_FRAME_OVERHEAD).max(1)
}

pub fn encode_data(header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let hdr = encode(header)?;
    let mut frame = Vec::with_capacity(5 + hdr.len() + payload.len());
    frame.push(KIND_DATA);
    frame.extend_from_slice(&(hdr.len() as u32).to_be_bytes());
    frame.extend_from_slice(&hdr);
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn decode_peer_message(mut frame: Vec<u8>) -> Result<PeerMessage> {
    let Some(&kind) = frame.first() else {
        return Err(CclError::Serialization("empty peer frame".into()));
    };
    match kind {
        KIND_CONTROL => Ok(PeerMessage::Control(decode(&frame[1..])?)),
        KIND_DATA => {
            if frame.len() < 5 {
                return Err(CclError::Serialization("truncated data frame".into()));
            }
            let mut len_buf = [0u8; 4];
            len_buf.copy_from_slice(&frame[1..5]);
            let hdr_len = u32::from_be_bytes(len_buf) as usize;
            let body_start = 5 + hdr_len;
            if frame.len() < body_start {
                return Err(CclError::Serialization(format!(
                    "data frame header claims {hdr_len} bytes, frame has {}",
                    frame.len() - 5
                )));
            }
            let header: FrameHeader = decode(&frame[5..body_start])?;
            // The payload keeps the frame's allocation.
            frame.drain(..body_start);
            Ok(PeerMessage::Data { header, payload: frame })
        }
        other => Err(CclError::Serialization(format!("unknown frame kind {other}"))),
    }
}

// ── Rendezvous frames ────────────────────────────────────────────────────────

pub async fn write_rendezvous<T>(io: &mut T, msg: &RendezvousMessage) -> Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    write_length_prefixed(io, &encode(msg)?).await?;
    Ok(())
}

pub async fn read_rendezvous<T>(io: &mut T) -> Result<RendezvousMessage>
where
    T: AsyncRead + Unpin + Send,
{
    let buf = read_length_prefixed(io, MAX_RENDEZVOUS_FRAME_BYTES).await?;
    decode(&buf)
}

// ── Wire Helpers ──────────────────────────────────────────────────────────────

/// Read a `[u32 BE length][payload]` frame.
pub async fn read_length_prefixed<T>(io: &mut T, max_bytes: usize) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {max_bytes})"),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a `[u32 BE length][payload]` frame.
pub async fn write_length_prefixed<T>(io: &mut T, data: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload exceeds u32::MAX: {} bytes", data.len()),
        )
    })?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ccl_types::{CollectiveKind, CollectiveSignature, DataType, ReduceOp};
    use uuid::Uuid;

    fn header() -> FrameHeader {
        FrameHeader {
            seq: 3,
            step: 1,
            chunk: 0,
            signature: CollectiveSignature {
                kind: CollectiveKind::AllReduce,
                dtype: Some(DataType::F32),
                count: 4,
                root: None,
                op: Some(ReduceOp::Sum),
            },
        }
    }

    #[test]
    fn data_frame_keeps_payload_raw() {
        let payload = vec![0xAB; 4096];
        let frame = encode_data(&header(), &payload).unwrap();
        assert_eq!(frame[0], KIND_DATA);
        assert_eq!(&frame[frame.len() - 4096..], payload.as_slice());

        let frame_len = frame.len();
        match decode_peer_message(frame).unwrap() {
            PeerMessage::Data { header: h, payload: p } => {
                assert_eq!(h, header());
                assert_eq!(p, payload);
                assert!(p.capacity() >= frame_len, "payload was copied out of the frame");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn largest_header_fits_the_overhead() {
        let mut hdr = header();
        hdr.seq = u64::MAX;
        hdr.step = u32::MAX;
        hdr.chunk = u32::MAX;
        hdr.signature.count = u64::MAX;
        hdr.signature.root = Some(u32::MAX);
        let frame = encode_data(&hdr, &[]).unwrap();
        assert!(frame.len() <= DATA_FRAME_OVERHEAD, "{} bytes", frame.len());
        assert_eq!(max_data_payload(DATA_FRAME_OVERHEAD + 10), 10);
        assert_eq!(max_data_payload(8), 1);
    }

    #[test]
    fn control_frame_decodes() {
        let msg = PeerControl::Hello { group_id: Uuid::new_v4(), rank: 3 };
        let frame = encode_control(&msg).unwrap();
        assert_eq!(decode_peer_message(frame).unwrap(), PeerMessage::Control(msg));
    }

    #[test]
    fn rejects_garbage_frames() {
        assert!(decode_peer_message(Vec::new()).is_err());
        assert!(decode_peer_message(vec![9, 0, 0]).is_err());
        // Header length pointing past the end of the frame.
        assert!(decode_peer_message(vec![KIND_DATA, 0, 0, 1, 0, 1, 2]).is_err());
    }

    #[tokio::test]
    async fn rendezvous_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = RendezvousMessage::CheckIn {
            rank: 1,
            world_size: 2,
            endpoint: "127.0.0.1:7000".into(),
        };
        write_rendezvous(&mut a, &msg).await.unwrap();
        assert_eq!(read_rendezvous(&mut b).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        // Fabricate a frame claiming 1000 bytes.
        let mut buf = Vec::new();
        buf.extend_from_slice(&1000u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 1000]);

        let err = read_length_prefixed(&mut buf.as_slice(), 16).await.unwrap_err();
        assert!(err.to_string().contains("frame too large"));
    }
}
