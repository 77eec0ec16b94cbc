//! ccl-node: rendezvous coordinator and collective workload harness.
//!
//! ```bash
//! # Standalone coordinator for 4-rank groups
//! RUST_LOG=info cargo run --bin ccl-node -- coordinator --listen 0.0.0.0:29500 --world-size 4
//!
//! # One rank of a 4-rank group replaying a workload file (rank 0 hosts the
//! # coordinator unless --no-host-coordinator is given)
//! cargo run --bin ccl-node -- run --rank 1 --world-size 4 \
//!     --master-addr 10.0.0.1 --master-port 29500 --workload DeepSpeed.csv --rounds 100
//!
//! # Every rank in this process over the in-memory transport
//! cargo run --bin ccl-node -- local --world-size 8 --dtype f16
//! ```

mod workload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ccl_collective::ProcessGroup;
use ccl_net::{MemFabric, RendezvousServer, TransportRegistry, MEM_PROVIDER};
use ccl_types::{DataType, EnvConfig, GroupOptions, Rank};

use workload::{OpReport, WorkloadItem};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "ccl-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Collective communication runtime: coordinator and workload harness"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve rendezvous rounds until Ctrl-C.
    Coordinator {
        #[arg(long, default_value = "0.0.0.0:29500")]
        listen: String,

        #[arg(long)]
        world_size: u32,

        /// Seconds a round may wait for every rank to check in.
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },

    /// Run one rank of a group.
    Run {
        #[arg(long)]
        rank: Rank,

        #[arg(long)]
        world_size: u32,

        #[arg(long, default_value = "127.0.0.1")]
        master_addr: String,

        #[arg(long, default_value_t = 29500)]
        master_port: u16,

        /// Transport provider for peer links.
        #[arg(long, default_value = "tcp")]
        transport: String,

        /// Connect to an external coordinator even as rank 0.
        #[arg(long)]
        no_host_coordinator: bool,

        #[command(flatten)]
        workload: WorkloadArgs,
    },

    /// Run every rank of a group inside this process over the in-memory
    /// transport.
    Local {
        #[arg(long, default_value_t = 4)]
        world_size: u32,

        /// Fail unless every rank's last all-reduce output is bitwise equal.
        #[arg(long)]
        verify: bool,

        #[command(flatten)]
        workload: WorkloadArgs,
    },
}

#[derive(Args, Clone)]
struct WorkloadArgs {
    /// CSV of `op,size,root` lines (reduce, allreduce, allgather, broadcast,
    /// gather, scatter, alltoall, barrier). A small built-in workload is used
    /// when omitted.
    #[arg(long)]
    workload: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    rounds: u32,

    #[arg(long, default_value = "f32")]
    dtype: DataType,

    /// Seconds allowed for rendezvous, and for any single receive.
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    /// All-reduce switches from tree to ring at this payload size.
    #[arg(long, default_value_t = 64 * 1024)]
    ring_threshold_bytes: usize,

    /// Compare collective signatures on every frame.
    #[arg(long)]
    verify_signatures: bool,
}

impl WorkloadArgs {
    fn items(&self, world_size: u32) -> Result<Vec<WorkloadItem>> {
        match &self.workload {
            Some(path) => workload::load(path, world_size),
            None => Ok(workload::default_workload()),
        }
    }

    fn options(&self, coordinator: String, world_size: u32, rank: Rank) -> GroupOptions {
        let timeout = Duration::from_secs(self.timeout_secs);
        let mut opts = GroupOptions::new(coordinator, world_size, rank).with_timeout(timeout);
        opts.op_timeout = timeout;
        opts.ring_threshold_bytes = self.ring_threshold_bytes;
        opts.verify_signatures = self.verify_signatures;
        opts
    }
}

#[derive(Serialize)]
struct Report<'a> {
    started_at: String,
    world_size: u32,
    transport: &'a str,
    dtype: &'a str,
    ops: Vec<OpReport>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=ccl_net=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Coordinator { listen, world_size, timeout_secs } =>
            run_coordinator(listen, world_size, Duration::from_secs(timeout_secs)).await,
        Command::Run { rank, world_size, master_addr, master_port, transport, no_host_coordinator, workload } =>
            run_rank(rank, world_size, format!("{master_addr}:{master_port}"), transport, !no_host_coordinator, workload).await,
        Command::Local { world_size, verify, workload } =>
            run_local(world_size, verify, workload).await,
    }
}

// ── Coordinator mode ──────────────────────────────────────────────────────────

async fn run_coordinator(listen: String, world_size: u32, timeout: Duration) -> Result<()> {
    let server = RendezvousServer::bind(&listen, world_size).await?;
    info!(addr = %server.local_addr()?, world_size, "coordinator listening, press Ctrl-C to stop");
    tokio::select! {
        _ = server.serve(timeout) => {}
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C, shutting down"),
    }
    Ok(())
}

// ── Single-rank mode ──────────────────────────────────────────────────────────

async fn run_rank(
    rank: Rank,
    world_size: u32,
    coordinator: String,
    transport: String,
    host_coordinator: bool,
    args: WorkloadArgs,
) -> Result<()> {
    let items = args.items(world_size)?;
    let env = EnvConfig::from_current_exe();
    let registry = TransportRegistry::from_env(&env);
    info!(providers = ?registry.names(), search_path = %env.provider_search_path.display(), "transport registry loaded");

    let mut opts = args.options(coordinator, world_size, rank).with_transport(transport);
    opts.host_coordinator = host_coordinator;
    let started_at = chrono::Utc::now().to_rfc3339();
    let group = ProcessGroup::create(opts, &env, &registry)
        .await
        .context("forming process group")?;

    let outcome = workload::execute(&group, &items, args.rounds, args.dtype).await;
    if let Err(e) = group.destroy().await {
        warn!(%e, "destroy failed");
    }
    let (ops, _) = outcome?;

    if rank == 0 {
        print_report(&Report {
            started_at,
            world_size,
            transport: group.transport(),
            dtype: args.dtype.name(),
            ops,
        })?;
    }
    Ok(())
}

// ── Local mode ────────────────────────────────────────────────────────────────

async fn run_local(world_size: u32, verify: bool, args: WorkloadArgs) -> Result<()> {
    if world_size == 0 {
        bail!("world size must be at least 1");
    }
    let items = Arc::new(args.items(world_size)?);
    let env = EnvConfig::from_current_exe();
    let registry = Arc::new(TransportRegistry::with_fabric(MemFabric::new()));

    let server = RendezvousServer::bind("127.0.0.1:0", world_size).await?;
    let coordinator = server.local_addr()?.to_string();
    let round = server.spawn_once(Duration::from_secs(args.timeout_secs));
    let started_at = chrono::Utc::now().to_rfc3339();

    let ranks = (0..world_size).map(|rank| {
        let mut opts = args.options(coordinator.clone(), world_size, rank).with_transport(MEM_PROVIDER);
        opts.host_coordinator = false;
        let (env, registry, items) = (env.clone(), registry.clone(), items.clone());
        let (rounds, dtype) = (args.rounds, args.dtype);
        tokio::spawn(async move {
            let group = ProcessGroup::create(opts, &env, &registry).await?;
            let outcome = workload::execute(&group, &items, rounds, dtype).await;
            group.destroy().await?;
            outcome
        })
    });
    let results = join_all(ranks).await;
    round.await?.context("rendezvous")?;

    let mut per_rank = Vec::with_capacity(results.len());
    for (rank, joined) in results.into_iter().enumerate() {
        let outcome = joined.with_context(|| format!("rank {rank} panicked"))?;
        per_rank.push(outcome.with_context(|| format!("rank {rank}"))?);
    }

    if verify {
        let reference = per_rank[0].1.as_ref().map(|b| b.as_bytes());
        for (rank, (_, last)) in per_rank.iter().enumerate().skip(1) {
            if last.as_ref().map(|b| b.as_bytes()) != reference {
                bail!("rank {rank} all-reduce output differs from rank 0");
            }
        }
        info!(world_size, "all-reduce outputs agree on every rank");
    }

    let (ops, _) = per_rank.swap_remove(0);
    print_report(&Report {
        started_at,
        world_size,
        transport: MEM_PROVIDER,
        dtype: args.dtype.name(),
        ops,
    })
}

// ── Report ────────────────────────────────────────────────────────────────────

fn print_report(report: &Report<'_>) -> Result<()> {
    for op in &report.ops {
        info!(
            "{:<10} size={:<9} root={:<3} {:>10.3} ms/round",
            op.op, op.size, op.root, op.mean_ms
        );
    }
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
