// ccl-net::rendezvous: control-plane group formation.
//
// The coordinator accepts one TCP connection per rank, collects
// `CheckIn { rank, world_size, endpoint }`, and once every rank is present
// answers each with `Table { group_id, endpoints }`. Any inconsistency or a
// timeout rejects the whole group.
//
// The control plane always runs over TCP, independent of the data-plane
// provider, so `mem` groups rendezvous the same way `tcp` groups do.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ccl_types::wire::RendezvousMessage;
use ccl_types::{CclError, Rank, Result};

use crate::codec::{read_rendezvous, write_rendezvous};

const CONNECT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_CONNECT_BACKOFF: Duration = Duration::from_millis(1000);

/// Outcome of a successful rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousTable {
    pub group_id: Uuid,
    /// `endpoints[i]` is rank `i`'s data-plane endpoint.
    pub endpoints: Vec<String>,
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Rendezvous coordinator for groups of a fixed `world_size`.
pub struct RendezvousServer {
    listener: TcpListener,
    world_size: u32,
}

impl RendezvousServer {
    pub async fn bind(addr: &str, world_size: u32) -> Result<Self> {
        if world_size == 0 {
            return Err(CclError::Config("world_size must be at least 1".into()));
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CclError::Rendezvous(format!("cannot listen on {addr}: {e}")))?;
        info!(addr = %listener.local_addr()?, world_size, "rendezvous coordinator listening");
        Ok(Self { listener, world_size })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Form one group. Every checked-in rank is answered, with the table on
    /// success or a rejection on failure.
    pub async fn run_once(&self, timeout: Duration) -> Result<RendezvousTable> {
        let n = self.world_size as usize;
        let deadline = Instant::now() + timeout;

        // Check-ins are read on their own tasks so a silent connection
        // cannot stall the others.
        let (tx, mut rx) = mpsc::channel::<(TcpStream, Result<RendezvousMessage>)>(n.max(1));
        let mut slots: Vec<Option<(TcpStream, String)>> = (0..n).map(|_| None).collect();
        let mut strays: Vec<TcpStream> = Vec::new();
        let mut checked_in = 0usize;

        let failure = loop {
            if checked_in == n {
                break None;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    break Some(format!(
                        "timed out after {timeout:?} with {checked_in}/{n} ranks checked in"
                    ));
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((mut stream, addr)) => {
                            debug!(%addr, "rendezvous connection");
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                let msg = tokio::time::timeout_at(deadline, read_rendezvous(&mut stream))
                                    .await
                                    .unwrap_or_else(|_| Err(CclError::Rendezvous("no check-in before deadline".into())));
                                let _ = tx.send((stream, msg)).await;
                            });
                        }
                        Err(e) => warn!(%e, "rendezvous accept failed"),
                    }
                }
                Some((stream, msg)) = rx.recv() => {
                    match msg {
                        Ok(RendezvousMessage::CheckIn { rank, world_size, endpoint }) => {
                            if world_size != self.world_size {
                                strays.push(stream);
                                break Some(format!(
                                    "rank {rank} reported world_size {world_size}, expected {}",
                                    self.world_size
                                ));
                            }
                            let Some(slot) = slots.get_mut(rank as usize) else {
                                strays.push(stream);
                                break Some(format!(
                                    "rank {rank} out of range for world size {}",
                                    self.world_size
                                ));
                            };
                            if slot.is_some() {
                                strays.push(stream);
                                break Some(format!("rank {rank} checked in twice"));
                            }
                            debug!(rank, %endpoint, "rank checked in");
                            *slot = Some((stream, endpoint));
                            checked_in += 1;
                        }
                        Ok(other) => warn!(?other, "unexpected rendezvous message"),
                        Err(e) => debug!(%e, "dropping rendezvous connection"),
                    }
                }
            }
        };

        let occupied = slots.into_iter().flatten();
        if let Some(reason) = failure {
            warn!(%reason, "rendezvous rejected");
            let rejected = RendezvousMessage::Rejected { reason: reason.clone() };
            for mut stream in occupied.map(|(s, _)| s).chain(strays) {
                let _ = write_rendezvous(&mut stream, &rejected).await;
            }
            return Err(CclError::Rendezvous(reason));
        }

        let (streams, endpoints): (Vec<TcpStream>, Vec<String>) = occupied.unzip();
        let table = RendezvousTable {
            group_id: Uuid::new_v4(),
            endpoints,
        };
        let reply = RendezvousMessage::Table {
            group_id: table.group_id,
            endpoints: table.endpoints.clone(),
        };
        for (rank, mut stream) in streams.into_iter().enumerate() {
            if let Err(e) = write_rendezvous(&mut stream, &reply).await {
                warn!(rank, %e, "failed to deliver rendezvous table");
            }
        }
        info!(group_id = %table.group_id, world_size = self.world_size, "group formed");
        Ok(table)
    }

    /// Form groups back to back until the task is dropped.
    pub async fn serve(self, timeout: Duration) {
        loop {
            if let Err(e) = self.run_once(timeout).await {
                warn!(%e, "rendezvous round failed");
            }
        }
    }

    /// Run a single round on a background task.
    pub fn spawn_once(self, timeout: Duration) -> JoinHandle<Result<RendezvousTable>> {
        tokio::spawn(async move { self.run_once(timeout).await })
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Check in with the coordinator at `coordinator` and wait for the table.
/// Connection attempts are retried until `timeout`, since ranks start in no
/// particular order.
pub async fn check_in(
    coordinator: &str,
    rank: Rank,
    world_size: u32,
    endpoint: &str,
    timeout: Duration,
) -> Result<RendezvousTable> {
    let deadline = Instant::now() + timeout;
    let mut stream = connect_until(coordinator, deadline, timeout).await?;

    let msg = RendezvousMessage::CheckIn {
        rank,
        world_size,
        endpoint: endpoint.to_string(),
    };
    write_rendezvous(&mut stream, &msg)
        .await
        .map_err(|e| CclError::Rendezvous(format!("check-in with {coordinator} failed: {e}")))?;
    debug!(rank, %coordinator, "checked in, waiting for group");

    let reply = tokio::time::timeout_at(deadline, read_rendezvous(&mut stream))
        .await
        .map_err(|_| CclError::Rendezvous(format!("no group formed within {timeout:?}")))?
        .map_err(|e| CclError::Rendezvous(format!("coordinator {coordinator} hung up: {e}")))?;

    match reply {
        RendezvousMessage::Table { group_id, endpoints } => {
            if endpoints.len() != world_size as usize {
                return Err(CclError::Rendezvous(format!(
                    "table lists {} endpoints for world size {world_size}",
                    endpoints.len()
                )));
            }
            Ok(RendezvousTable { group_id, endpoints })
        }
        RendezvousMessage::Rejected { reason } => Err(CclError::Rendezvous(reason)),
        RendezvousMessage::CheckIn { .. } => Err(CclError::Rendezvous(
            "coordinator answered with a check-in".into(),
        )),
    }
}

async fn connect_until(addr: &str, deadline: Instant, timeout: Duration) -> Result<TcpStream> {
    let mut backoff = CONNECT_BACKOFF;
    loop {
        let last_err = match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connect timed out".to_string(),
        };
        if Instant::now() + backoff >= deadline {
            return Err(CclError::Rendezvous(format!(
                "coordinator {addr} unreachable within {timeout:?}: {last_err}"
            )));
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_CONNECT_BACKOFF);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
