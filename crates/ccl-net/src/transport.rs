// ccl-net::transport: the provider seam.
//
// A provider knows how to bind a listener and dial an endpoint string it
// produced. Everything above it (framing, links, mesh) is provider-agnostic.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::debug;

use ccl_types::{CclError, Rank, Result};

/// Byte stream produced by a provider.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn PeerStream>;

/// A bound data-plane listener.
#[async_trait]
pub trait Listener: Send {
    /// Endpoint string peers pass to [`TransportProvider::dial`].
    fn endpoint(&self) -> String;

    async fn accept(&mut self) -> io::Result<BoxedStream>;
}

/// A pluggable transport implementation, selected by name at group
/// creation.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    fn name(&self) -> &str;

    /// `false` when the provider cannot move data at all.
    fn is_available(&self) -> bool {
        true
    }

    async fn listen(&self, bind_host: &str) -> Result<Box<dyn Listener>>;

    async fn dial(&self, endpoint: &str) -> io::Result<BoxedStream>;
}

// ── Dial ──────────────────────────────────────────────────────────────────────

const INITIAL_BACKOFF: Duration = Duration::from_millis(20);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Dial `endpoint` until it answers or `timeout` elapses. Peers bind their
/// listeners before checking in, but a dial can still race the accept
/// backlog, so refused connections are retried with backoff.
pub async fn dial_with_retry(
    provider: &dyn TransportProvider,
    peer: Rank,
    endpoint: &str,
    timeout: Duration,
) -> Result<BoxedStream> {
    let deadline = Instant::now() + timeout;
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let last_err = match tokio::time::timeout(remaining, provider.dial(endpoint)).await {
            Ok(Ok(stream)) => {
                debug!(peer, %endpoint, attempt, "dialed peer");
                return Ok(stream);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "dial timed out".to_string(),
        };

        if Instant::now() + backoff >= deadline {
            return Err(CclError::Connection {
                peer,
                reason: format!(
                    "{endpoint} not reachable after {attempt} attempts in {timeout:?}: {last_err}"
                ),
            });
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
