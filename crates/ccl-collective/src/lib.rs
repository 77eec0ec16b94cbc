//! `ccl-collective`: collective operations over a process group.
//!
//! Ranks form a group through a rendezvous, open one link to every peer,
//! and then run `broadcast`, `reduce`, `all_reduce`, `all_gather`, `gather`,
//! `scatter`, `all_to_all` and `barrier` over caller-owned typed buffers.
//!
//! # Architecture
//!
//! ```text
//!  caller ──submit──▶ OperationScheduler ──FIFO──▶ CollectiveEngine
//!                            │                         │  tree / ring
//!                     CompletionHandle                 ▼
//!                                                   LinkSet ──▶ peers
//!                                                      │
//!                               FaultSignal ◀── link monitor
//! ```
//!
//! Every rank must submit the same collectives in the same order.

pub mod algorithms;
pub mod default_group;
pub mod directory;
pub mod engine;
pub mod fault;
pub mod group;
pub mod liveness;
pub mod reduce;
pub mod scheduler;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use ccl_types::{is_available, BufferDescriptor, CclError, Result};
pub use default_group::{DefaultGroup, Reservation};
pub use directory::RankDirectory;
pub use engine::{CollectiveEngine, EngineConfig};
pub use fault::{Fault, FaultSignal};
pub use group::{GroupState, ProcessGroup};
pub use liveness::Liveness;
pub use scheduler::{CompletionHandle, OperationScheduler, RequestStatus};

use std::time::Duration;

use ccl_net::{TransportRegistry, MEM_PROVIDER, TCP_PROVIDER};
use ccl_types::{EnvConfig, GroupOptions, Rank};

// ── Initialization hook ──────────────────────────────────────────────────────

/// Backend name under which a deployment may register its own provider.
pub const CCL_BACKEND: &str = "ccl";

/// Create a group from a `tcp://host:port` rendezvous URL, reading the
/// environment and provider manifests the way an embedding runtime would.
pub async fn init(
    backend: &str,
    rendezvous_url: &str,
    world_size: u32,
    rank: Rank,
    timeout: Duration,
) -> Result<ProcessGroup> {
    let env = EnvConfig::from_current_exe();
    let registry = TransportRegistry::from_env(&env);
    init_with(backend, rendezvous_url, world_size, rank, timeout, &env, &registry).await
}

/// [`init`] with an explicit environment and registry.
pub async fn init_with(
    backend: &str,
    rendezvous_url: &str,
    world_size: u32,
    rank: Rank,
    timeout: Duration,
    env: &EnvConfig,
    registry: &TransportRegistry,
) -> Result<ProcessGroup> {
    let transport = backend_transport(backend, registry)?;
    let address = parse_rendezvous_url(rendezvous_url)?;
    let options = GroupOptions::new(address, world_size, rank)
        .with_timeout(timeout)
        .with_transport(transport);
    ProcessGroup::create(options, env, registry).await
}

/// Map a backend name onto a registered transport provider.
pub fn backend_transport(backend: &str, registry: &TransportRegistry) -> Result<String> {
    match backend.to_ascii_lowercase().as_str() {
        CCL_BACKEND if registry.contains(CCL_BACKEND) => Ok(CCL_BACKEND.to_string()),
        CCL_BACKEND | TCP_PROVIDER => Ok(TCP_PROVIDER.to_string()),
        MEM_PROVIDER => Ok(MEM_PROVIDER.to_string()),
        other => Err(CclError::InvalidArgument(format!("unknown backend '{other}'"))),
    }
}

/// `tcp://host:port` → `host:port`.
pub fn parse_rendezvous_url(url: &str) -> Result<String> {
    let address = url.strip_prefix("tcp://").ok_or_else(|| {
        CclError::Config(format!("rendezvous url '{url}' must start with tcp://"))
    })?;
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(address.to_string())
        }
        _ => Err(CclError::Config(format!(
            "rendezvous url '{url}' must look like tcp://host:port"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rendezvous_urls() {
        assert_eq!(parse_rendezvous_url("tcp://127.0.0.1:29500").unwrap(), "127.0.0.1:29500");
        assert_eq!(parse_rendezvous_url("tcp://node-0:1234").unwrap(), "node-0:1234");
        assert!(parse_rendezvous_url("env://").is_err());
        assert!(parse_rendezvous_url("tcp://127.0.0.1").is_err());
        assert!(parse_rendezvous_url("tcp://:80").is_err());
        assert!(parse_rendezvous_url("tcp://host:http").is_err());
    }

    #[test]
    fn backend_names() {
        let mut registry = TransportRegistry::with_builtins();
        assert_eq!(backend_transport("ccl", &registry).unwrap(), "tcp");
        assert_eq!(backend_transport("TCP", &registry).unwrap(), "tcp");
        assert_eq!(backend_transport("mem", &registry).unwrap(), "mem");
        assert!(backend_transport("nccl", &registry).is_err());

        registry.register("ccl", Arc::new(ccl_net::TcpProvider));
        assert_eq!(backend_transport("ccl", &registry).unwrap(), "ccl");
    }

    #[tokio::test]
    async fn init_single_rank() {
        let pg = init("ccl", "tcp://127.0.0.1:1", 1, 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pg.world_size(), 1);
        pg.destroy().await.unwrap();
    }
}
