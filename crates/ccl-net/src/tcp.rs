// ccl-net::tcp: the default provider: plain TCP with Nagle disabled.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use ccl_types::{CclError, Result};

use crate::transport::{BoxedStream, Listener, TransportProvider};

pub const TCP_PROVIDER: &str = "tcp";

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProvider;

#[async_trait]
impl TransportProvider for TcpProvider {
    fn name(&self) -> &str {
        TCP_PROVIDER
    }

    async fn listen(&self, bind_host: &str) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind((bind_host, 0u16))
            .await
            .map_err(|e| CclError::transport(None, format!("bind {bind_host}:0: {e}")))?;
        let local = listener.local_addr()?;
        let endpoint = advertised_endpoint(local);
        debug!(%endpoint, "tcp listener bound");
        Ok(Box::new(TcpPeerListener { listener, endpoint }))
    }

    async fn dial(&self, endpoint: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// A wildcard bind is not dialable; advertise loopback instead.
fn advertised_endpoint(local: SocketAddr) -> String {
    if local.ip().is_unspecified() {
        warn!(%local, "listener bound to a wildcard address, advertising loopback");
        let loopback: std::net::IpAddr = if local.is_ipv4() {
            std::net::Ipv4Addr::LOCALHOST.into()
        } else {
            std::net::Ipv6Addr::LOCALHOST.into()
        };
        SocketAddr::new(loopback, local.port()).to_string()
    } else {
        local.to_string()
    }
}

struct TcpPeerListener {
    listener: TcpListener,
    endpoint: String,
}

#[async_trait]
impl Listener for TcpPeerListener {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn accept(&mut self) -> io::Result<BoxedStream> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%addr, "accepted tcp peer");
        Ok(Box::new(stream))
    }
}
