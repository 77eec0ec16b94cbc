// ccl-net::mem: in-process provider over `tokio::io::duplex` pipes.
//
// All ranks that share one `MemFabric` can reach each other. Used by the
// single-process `local` harness and by tests.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use ccl_types::{CclError, Result};

use crate::transport::{BoxedStream, Listener, TransportProvider};

pub const MEM_PROVIDER: &str = "mem";

/// Per-direction pipe buffer. Writers block once this much is in flight.
const PIPE_CAPACITY: usize = 1024 * 1024;

/// Pending dials per listener before `dial` waits.
const BACKLOG: usize = 128;

/// Shared address space for in-process links.
#[derive(Debug, Default)]
pub struct MemFabric {
    listeners: Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>,
    next_id: AtomicU64,
}

impl MemFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<DuplexStream>>> {
        // A poisoned map is still structurally valid.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct MemProvider {
    fabric: Arc<MemFabric>,
}

impl MemProvider {
    pub fn new(fabric: Arc<MemFabric>) -> Self {
        Self { fabric }
    }
}

#[async_trait]
impl TransportProvider for MemProvider {
    fn name(&self) -> &str {
        MEM_PROVIDER
    }

    async fn listen(&self, bind_host: &str) -> Result<Box<dyn Listener>> {
        let id = self.fabric.next_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = format!("mem://{bind_host}/{id}");
        let (tx, rx) = mpsc::channel(BACKLOG);
        if self.fabric.lock().insert(endpoint.clone(), tx).is_some() {
            return Err(CclError::transport(None, format!("{endpoint} already bound")));
        }
        Ok(Box::new(MemListener {
            endpoint,
            incoming: rx,
            fabric: self.fabric.clone(),
        }))
    }

    async fn dial(&self, endpoint: &str) -> io::Result<BoxedStream> {
        let tx = self.fabric.lock().get(endpoint).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("{endpoint} not bound"))
        })?;
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send(far).await.map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("{endpoint} closed"))
        })?;
        Ok(Box::new(near))
    }
}

struct MemListener {
    endpoint: String,
    incoming: mpsc::Receiver<DuplexStream>,
    fabric: Arc<MemFabric>,
}

#[async_trait]
impl Listener for MemListener {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn accept(&mut self) -> io::Result<BoxedStream> {
        match self.incoming.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
        }
    }
}

impl Drop for MemListener {
    fn drop(&mut self) {
        self.fabric.lock().remove(&self.endpoint);
    }
}
