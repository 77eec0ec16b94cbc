// ccl-net::mesh: eager full-mesh link establishment.
//
// Rank r dials every peer p > r and accepts from every peer p < r. The
// dialer's first frame is `Hello { group_id, rank }`; the acceptor checks
// both before adopting the stream. When `establish` returns, a link to every
// peer exists.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ccl_types::wire::{PeerControl, PeerMessage};
use ccl_types::{CclError, Rank, Result};

use crate::codec;
use crate::events::LinkEvent;
use crate::link::Link;
use crate::transport::{dial_with_retry, BoxedStream, Listener, TransportProvider};

/// Largest hello frame accepted from an unauthenticated stream.
const MAX_HELLO_BYTES: usize = 4096;

/// One link per peer of a group, indexed by rank. The local rank's slot is
/// empty.
#[derive(Debug)]
pub struct LinkSet {
    rank: Rank,
    links: Vec<Option<Arc<Link>>>,
}

impl LinkSet {
    /// A set with no links, for single-rank groups and unusable transports.
    pub fn empty(rank: Rank, world_size: u32) -> Self {
        Self {
            rank,
            links: (0..world_size).map(|_| None).collect(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.links.len() as u32
    }

    pub fn get(&self, peer: Rank) -> Result<&Arc<Link>> {
        self.links
            .get(peer as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| CclError::Connection {
                peer,
                reason: "no link was established".into(),
            })
    }

    pub fn links(&self) -> impl Iterator<Item = &Arc<Link>> {
        self.links.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.links().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Say goodbye on every link and stop their tasks.
    pub async fn close_all(&self) {
        futures::future::join_all(self.links().map(|l| l.close())).await;
    }
}

/// Parameters for [`establish`].
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub rank: Rank,
    pub group_id: Uuid,
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
}

/// Open a link to every rank listed in `endpoints`.
pub async fn establish(
    provider: &dyn TransportProvider,
    mut listener: Box<dyn Listener>,
    endpoints: &[String],
    config: &MeshConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> Result<LinkSet> {
    let world_size = endpoints.len() as u32;
    let rank = config.rank;
    let mut set = LinkSet::empty(rank, world_size);

    let dials = ((rank + 1)..world_size).map(|peer| {
        let endpoint = endpoints[peer as usize].as_str();
        let events = events.clone();
        async move {
            let mut stream = dial_with_retry(provider, peer, endpoint, config.connect_timeout).await?;
            let hello = codec::encode_control(&PeerControl::Hello {
                group_id: config.group_id,
                rank,
            })?;
            codec::write_length_prefixed(&mut stream, &hello)
                .await
                .map_err(|e| CclError::Connection {
                    peer,
                    reason: format!("hello to {endpoint} failed: {e}"),
                })?;
            debug!(rank, peer, "link dialed");
            Ok::<_, CclError>((peer, Link::spawn(peer, stream, events, config.max_frame_bytes)))
        }
    });

    let accepts = accept_lower_ranks(listener.as_mut(), config, events.clone());

    let (dialed, accepted) = tokio::try_join!(try_join_all(dials), accepts)?;
    for (peer, link) in dialed.into_iter().chain(accepted) {
        set.links[peer as usize] = Some(link);
    }

    info!(rank, world_size, links = set.len(), "full mesh established");
    Ok(set)
}

async fn accept_lower_ranks(
    listener: &mut dyn Listener,
    config: &MeshConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> Result<Vec<(Rank, Arc<Link>)>> {
    let rank = config.rank;
    let deadline = Instant::now() + config.connect_timeout;
    let mut pending: Vec<bool> = vec![true; rank as usize];
    let mut accepted = Vec::with_capacity(rank as usize);

    while accepted.len() < rank as usize {
        let missing = || pending.iter().position(|p| *p).unwrap_or(0) as Rank;

        let mut stream = match tokio::time::timeout_at(deadline, listener.accept()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(CclError::Connection {
                    peer: missing(),
                    reason: format!("accept failed: {e}"),
                })
            }
            Err(_) => {
                return Err(CclError::Connection {
                    peer: missing(),
                    reason: format!("rank did not connect within {:?}", config.connect_timeout),
                })
            }
        };

        let hello = tokio::time::timeout_at(deadline, read_hello(&mut stream)).await;
        let peer = match hello {
            Ok(Ok((group_id, peer))) if group_id == config.group_id => peer,
            Ok(Ok((group_id, peer))) => {
                warn!(rank, peer, %group_id, "hello from a different group, dropping");
                continue;
            }
            Ok(Err(e)) => {
                warn!(rank, %e, "bad hello, dropping stream");
                continue;
            }
            Err(_) => continue,
        };

        match pending.get_mut(peer as usize) {
            Some(slot) if *slot => {
                *slot = false;
                debug!(rank, peer, "link accepted");
                accepted.push((peer, Link::spawn(peer, stream, events.clone(), config.max_frame_bytes)));
            }
            _ => warn!(rank, peer, "unexpected or duplicate hello, dropping"),
        }
    }
    Ok(accepted)
}

async fn read_hello(stream: &mut BoxedStream) -> Result<(Uuid, Rank)> {
    let frame = codec::read_length_prefixed(stream, MAX_HELLO_BYTES).await?;
    match codec::decode_peer_message(frame)? {
        PeerMessage::Control(PeerControl::Hello { group_id, rank }) => Ok((group_id, rank)),
        other => Err(CclError::Serialization(format!("expected hello, got {other:?}"))),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{MemFabric, MemProvider};
    use crate::tcp::TcpProvider;
    use ccl_types::wire::FrameHeader;
    use ccl_types::{CollectiveKind, CollectiveSignature};

    async fn mesh(
        provider: Arc<dyn TransportProvider>,
        n: u32,
    ) -> Vec<(LinkSet, mpsc::UnboundedReceiver<LinkEvent>)> {
        let mut listeners = Vec::new();
        for _ in 0..n {
            listeners.push(provider.listen("127.0.0.1").await.unwrap());
        }
        let endpoints: Vec<String> = listeners.iter().map(|l| l.endpoint()).collect();
        let group_id = Uuid::new_v4();

        let tasks: Vec<_> = listeners
            .into_iter()
            .enumerate()
            .map(|(rank, listener)| {
                let provider = provider.clone();
                let endpoints = endpoints.clone();
                tokio::spawn(async move {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let config = MeshConfig {
                        rank: rank as Rank,
                        group_id,
                        connect_timeout: Duration::from_secs(5),
                        max_frame_bytes: codec::DEFAULT_MAX_FRAME_BYTES,
                    };
                    let set = establish(provider.as_ref(), listener, &endpoints, &config, tx)
                        .await
                        .unwrap();
                    (set, rx)
                })
            })
            .collect();

        let mut out = Vec::new();
        for t in tasks {
            out.push(t.await.unwrap());
        }
        out
    }

    fn header() -> FrameHeader {
        FrameHeader {
            seq: 0,
            step: 0,
            chunk: 0,
            signature: CollectiveSignature {
                kind: CollectiveKind::Barrier,
                dtype: None,
                count: 0,
                root: None,
                op: None,
            },
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mem_mesh_connects_every_pair() {
        let provider: Arc<dyn TransportProvider> = Arc::new(MemProvider::new(MemFabric::new()));
        let sets = mesh(provider, 4).await;

        for (rank, (set, _)) in sets.iter().enumerate() {
            assert_eq!(set.len(), 3);
            assert!(set.get(rank as Rank).is_err());
        }

        // Rank 3 -> rank 0 and back.
        sets[3].0.get(0).unwrap().send_data(&header(), b"hi").await.unwrap();
        let got = sets[0].0.get(3).unwrap().recv().await.unwrap();
        assert_eq!(got.payload, b"hi");
        sets[0].0.get(3).unwrap().send_data(&header(), b"yo").await.unwrap();
        let got = sets[3].0.get(0).unwrap().recv().await.unwrap();
        assert_eq!(got.payload, b"yo");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tcp_mesh_connects_every_pair() {
        let provider: Arc<dyn TransportProvider> = Arc::new(TcpProvider);
        let sets = mesh(provider, 3).await;
        sets[1].0.get(2).unwrap().send_data(&header(), b"x").await.unwrap();
        assert_eq!(sets[2].0.get(1).unwrap().recv().await.unwrap().payload, b"x");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_all_reaches_every_peer() {
        let provider: Arc<dyn TransportProvider> = Arc::new(MemProvider::new(MemFabric::new()));
        let mut sets = mesh(provider, 3).await;
        sets[2].0.close_all().await;

        for (set_rank, (_, events)) in sets.iter_mut().enumerate().take(2) {
            let ev = events.recv().await.unwrap();
            assert_eq!(ev, LinkEvent::Closed { peer: 2 }, "rank {set_rank}");
        }
    }

    #[tokio::test]
    async fn missing_peer_is_a_connection_error() {
        let provider = MemProvider::new(MemFabric::new());
        let listener = provider.listen("a").await.unwrap();
        let endpoints = vec![listener.endpoint(), "mem://nowhere/9".to_string()];
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = MeshConfig {
            rank: 0,
            group_id: Uuid::new_v4(),
            connect_timeout: Duration::from_millis(200),
            max_frame_bytes: codec::DEFAULT_MAX_FRAME_BYTES,
        };
        let err = establish(&provider, listener, &endpoints, &config, tx).await.unwrap_err();
        assert!(matches!(err, CclError::Connection { peer: 1, .. }));
    }
}
