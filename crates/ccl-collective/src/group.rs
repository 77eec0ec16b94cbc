//! Process groups: rendezvous, link mesh, engine and scheduler bundled
//! behind one handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ccl_net::{mesh, LinkSet, MeshConfig, RendezvousServer, TransportRegistry};
use ccl_types::{
    Buffer, CclError, CollectiveOutput, CollectiveRequest, EnvConfig, GroupOptions, Rank,
    ReduceOp, Result,
};

use crate::directory::RankDirectory;
use crate::engine::{CollectiveEngine, EngineConfig};
use crate::fault::{self, Fault, FaultSignal};
use crate::liveness::Liveness;
use crate::scheduler::{CompletionHandle, OperationScheduler};

// ── State ────────────────────────────────────────────────────────────────────

/// Active → Faulted → Destroyed, or Active → Destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Active,
    Faulted,
    Destroyed,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active    => write!(f, "Active"),
            Self::Faulted   => write!(f, "Faulted"),
            Self::Destroyed => write!(f, "Destroyed"),
        }
    }
}

// ── Process Group ────────────────────────────────────────────────────────────

pub struct ProcessGroup {
    directory: RankDirectory,
    transport: String,
    links: Arc<LinkSet>,
    scheduler: OperationScheduler,
    fault: FaultSignal,
    shutdown: CancellationToken,
    destroyed: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessGroup {
    /// Rendezvous with every rank, open a link to each peer, and start the
    /// dispatcher and link monitor.
    pub async fn create(
        options: GroupOptions,
        env: &EnvConfig,
        registry: &TransportRegistry,
    ) -> Result<Self> {
        options.validate()?;
        let rank = options.rank;
        let world_size = options.world_size;
        debug!(rank, world_size, root = %env.root_path.display(), "creating process group");

        if world_size == 1 {
            return Ok(Self::assemble(
                RankDirectory::local(),
                "local".to_string(),
                LinkSet::empty(0, 1),
                None,
                &options,
                true,
            ));
        }

        let provider = registry.resolve(&options.transport);
        let available = provider.is_available();
        let listener = if available {
            Some(provider.listen(&options.bind_host).await?)
        } else {
            warn!(rank, transport = %options.transport, "no usable transport, group will have no links");
            None
        };
        let endpoint = listener.as_ref().map(|l| l.endpoint()).unwrap_or_default();

        let coordinator = if rank == 0 && options.host_coordinator {
            let server = RendezvousServer::bind(&options.coordinator_address, world_size).await?;
            Some(server.spawn_once(options.rendezvous_timeout))
        } else {
            None
        };

        let table = ccl_net::check_in(
            &options.coordinator_address,
            rank,
            world_size,
            &endpoint,
            options.rendezvous_timeout,
        )
        .await;
        if let Some(coordinator) = coordinator {
            // The round has ended one way or another once this rank has its
            // answer; don't leave the listener behind on failure.
            if table.is_err() {
                coordinator.abort();
            }
        }
        let directory = RankDirectory::new(rank, table?)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let links = match listener {
            Some(listener) => {
                let config = MeshConfig {
                    rank,
                    group_id: directory.group_id(),
                    connect_timeout: options.connect_timeout,
                    max_frame_bytes: options.max_frame_bytes,
                };
                mesh::establish(provider.as_ref(), listener, directory.endpoints(), &config, events_tx)
                    .await?
            }
            None => LinkSet::empty(rank, world_size),
        };

        let group = Self::assemble(
            directory,
            provider.name().to_string(),
            links,
            Some(events_rx),
            &options,
            available,
        );
        info!(
            rank,
            world_size,
            group_id = %group.group_id(),
            transport = %group.transport,
            "process group ready"
        );
        Ok(group)
    }

    fn assemble(
        directory: RankDirectory,
        transport: String,
        links: LinkSet,
        events: Option<mpsc::UnboundedReceiver<ccl_net::LinkEvent>>,
        options: &GroupOptions,
        transport_available: bool,
    ) -> Self {
        let links = Arc::new(links);
        let fault = FaultSignal::new();
        let liveness = Arc::new(Liveness::new());
        let shutdown = CancellationToken::new();

        let monitor = events.map(|events| {
            fault::spawn_monitor(
                directory.rank(),
                events,
                fault.clone(),
                links.clone(),
                liveness.clone(),
                shutdown.clone(),
            )
        });
        let engine = CollectiveEngine::new(
            links.clone(),
            fault.clone(),
            liveness,
            EngineConfig::from(options),
            transport_available,
        );
        let scheduler =
            OperationScheduler::spawn(engine, options.queue_depth, fault.clone(), shutdown.clone());

        Self {
            directory,
            transport,
            links,
            scheduler,
            fault,
            shutdown,
            destroyed: AtomicBool::new(false),
            monitor: Mutex::new(monitor),
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn rank(&self) -> Rank {
        self.directory.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.directory.world_size()
    }

    pub fn group_id(&self) -> Uuid {
        self.directory.group_id()
    }

    pub fn directory(&self) -> &RankDirectory {
        &self.directory
    }

    /// Name of the provider carrying this group's links.
    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn state(&self) -> GroupState {
        if self.destroyed.load(Ordering::Acquire) {
            GroupState::Destroyed
        } else if self.fault.is_set() {
            GroupState::Faulted
        } else {
            GroupState::Active
        }
    }

    /// The fault that moved this group out of `Active`, if any.
    pub fn fault(&self) -> Option<Fault> {
        self.fault.current()
    }

    // ── Submission ──────────────────────────────────────────────────────

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(CclError::InvalidState(format!(
                "process group {} has been destroyed",
                self.group_id()
            )));
        }
        Ok(())
    }

    /// Run `request` and wait for it.
    pub async fn submit(&self, request: CollectiveRequest) -> Result<CollectiveOutput> {
        self.ensure_live()?;
        self.scheduler.submit(request).await
    }

    /// Queue `request` and return a handle to poll, wait on, or cancel.
    pub async fn submit_async(&self, request: CollectiveRequest) -> Result<CompletionHandle> {
        self.ensure_live()?;
        self.scheduler.submit_async(request).await
    }

    pub async fn broadcast(&self, root: Rank, buffer: Buffer) -> Result<Buffer> {
        match self.submit(CollectiveRequest::Broadcast { root, buffer }).await? {
            CollectiveOutput::Broadcast { buffer } => Ok(buffer),
            other => Err(unexpected(other)),
        }
    }

    /// Returns `output`; only root's holds the reduction.
    pub async fn reduce(&self, root: Rank, op: ReduceOp, input: Buffer, output: Buffer) -> Result<Buffer> {
        match self.submit(CollectiveRequest::Reduce { root, op, input, output }).await? {
            CollectiveOutput::Reduce { output, .. } => Ok(output),
            other => Err(unexpected(other)),
        }
    }

    pub async fn all_reduce(&self, op: ReduceOp, input: Buffer, output: Buffer) -> Result<Buffer> {
        match self.submit(CollectiveRequest::AllReduce { op, input, output }).await? {
            CollectiveOutput::AllReduce { output, .. } => Ok(output),
            other => Err(unexpected(other)),
        }
    }

    pub async fn all_gather(&self, input: Buffer, outputs: Vec<Buffer>) -> Result<Vec<Buffer>> {
        match self.submit(CollectiveRequest::AllGather { input, outputs }).await? {
            CollectiveOutput::AllGather { outputs, .. } => Ok(outputs),
            other => Err(unexpected(other)),
        }
    }

    /// Returns `outputs`: one buffer per rank on root, empty elsewhere.
    pub async fn gather(&self, root: Rank, input: Buffer, outputs: Vec<Buffer>) -> Result<Vec<Buffer>> {
        match self.submit(CollectiveRequest::Gather { root, input, outputs }).await? {
            CollectiveOutput::Gather { outputs, .. } => Ok(outputs),
            other => Err(unexpected(other)),
        }
    }

    /// `inputs` holds one buffer per rank on root and is empty elsewhere.
    pub async fn scatter(&self, root: Rank, inputs: Vec<Buffer>, output: Buffer) -> Result<Buffer> {
        match self.submit(CollectiveRequest::Scatter { root, inputs, output }).await? {
            CollectiveOutput::Scatter { output, .. } => Ok(output),
            other => Err(unexpected(other)),
        }
    }

    pub async fn all_to_all(&self, inputs: Vec<Buffer>, outputs: Vec<Buffer>) -> Result<Vec<Buffer>> {
        match self.submit(CollectiveRequest::AllToAll { inputs, outputs }).await? {
            CollectiveOutput::AllToAll { outputs, .. } => Ok(outputs),
            other => Err(unexpected(other)),
        }
    }

    pub async fn barrier(&self) -> Result<()> {
        match self.submit(CollectiveRequest::Barrier).await? {
            CollectiveOutput::Barrier => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Stop the dispatcher and monitor and close every link. A second call
    /// is an error.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(CclError::InvalidState(format!(
                "process group {} already destroyed",
                self.group_id()
            )));
        }
        self.scheduler.shutdown().await;
        let monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
        self.links.close_all().await;
        info!(rank = self.rank(), group_id = %self.group_id(), "process group destroyed");
        Ok(())
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.shutdown.cancel();
            for link in self.links.links() {
                link.abort();
            }
        }
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .field("group_id", &self.group_id())
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish()
    }
}

fn unexpected(output: CollectiveOutput) -> CclError {
    CclError::InvalidState(format!("engine returned a {} result", output.kind()))
}
