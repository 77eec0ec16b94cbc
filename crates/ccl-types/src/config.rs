// Configuration structs. `EnvConfig` is read once at process start;
// `GroupOptions` is passed by reference into group creation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CclError, Result};
use crate::Rank;

// ── Environment ──────────────────────────────────────────────────────────────

/// Environment variable naming the base install directory.
pub const ENV_ROOT_PATH: &str = "CCL_ROOT";

/// Environment variable naming the transport provider search directory.
pub const ENV_PROVIDER_SEARCH_PATH: &str = "FI_PROVIDER_PATH";

/// Process-wide settings derived from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    /// Base install directory used to locate provider plugins.
    pub root_path: PathBuf,

    /// Directory scanned for transport provider manifests.
    /// Defaults to `<install_dir>/lib/prov`.
    pub provider_search_path: PathBuf,
}

impl EnvConfig {
    /// Read `CCL_ROOT` / `FI_PROVIDER_PATH`, falling back to values derived
    /// from `install_dir` for whichever is unset. Set values are kept as-is.
    pub fn from_env(install_dir: &Path) -> Self {
        Self::from_lookup(install_dir, |key| std::env::var_os(key).map(PathBuf::from))
    }

    /// Same as [`Self::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(install_dir: &Path, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<PathBuf>,
    {
        let root_path = lookup(ENV_ROOT_PATH)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| install_dir.to_path_buf());

        let provider_search_path = lookup(ENV_PROVIDER_SEARCH_PATH)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| install_dir.join("lib").join("prov"));

        Self {
            root_path,
            provider_search_path,
        }
    }

    /// Defaults relative to the running executable's directory.
    pub fn from_current_exe() -> Self {
        let install_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_env(&install_dir)
    }
}

// ── Group ────────────────────────────────────────────────────────────────────

/// Default transport provider name.
pub const DEFAULT_TRANSPORT: &str = "tcp";

/// Rendezvous parameters plus per-group tuning.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// `host:port` of the rendezvous coordinator.
    pub coordinator_address: String,
    pub world_size: u32,
    pub rank: Rank,

    /// Bound on the whole rendezvous (check-in of every rank).
    pub rendezvous_timeout: Duration,

    /// Bound on dialing a single peer link.
    /// Default: 30 seconds.
    pub connect_timeout: Duration,

    /// Bound on any single receive inside a collective. A peer silent for
    /// longer is reported as the failed peer.
    /// Default: 60 seconds.
    pub op_timeout: Duration,

    /// Transport provider name looked up in the registry.
    pub transport: String,

    /// Host the data-plane listener binds to (port is OS-assigned).
    pub bind_host: String,

    /// All-reduce payloads below this many bytes use the tree algorithm,
    /// larger ones the ring algorithm.
    /// Default: 64 KiB.
    pub ring_threshold_bytes: usize,

    /// Compare collective signatures carried in frames and fail fast with
    /// `MismatchedCollective`. Default: on in debug builds.
    pub verify_signatures: bool,

    /// Rank 0 serves the rendezvous on `coordinator_address`.
    pub host_coordinator: bool,

    /// Pending-request capacity of the operation scheduler.
    pub queue_depth: usize,

    /// Largest single frame accepted from a peer.
    /// Default: 256 MiB.
    pub max_frame_bytes: usize,
}

impl GroupOptions {
    pub fn new(coordinator_address: impl Into<String>, world_size: u32, rank: Rank) -> Self {
        Self {
            coordinator_address: coordinator_address.into(),
            world_size,
            rank,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = transport.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(CclError::Config("world_size must be at least 1".into()));
        }
        if self.rank >= self.world_size {
            return Err(CclError::Config(format!(
                "rank {} out of range for world size {}",
                self.rank, self.world_size
            )));
        }
        if self.queue_depth == 0 {
            return Err(CclError::Config("queue_depth must be at least 1".into()));
        }
        if self.coordinator_address.is_empty() && self.world_size > 1 {
            return Err(CclError::Config("coordinator address is required".into()));
        }
        Ok(())
    }
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            coordinator_address: "127.0.0.1:29500".into(),
            world_size: 1,
            rank: 0,
            rendezvous_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            op_timeout: Duration::from_secs(60),
            transport: DEFAULT_TRANSPORT.into(),
            bind_host: "127.0.0.1".into(),
            ring_threshold_bytes: 64 * 1024,
            verify_signatures: cfg!(debug_assertions),
            host_coordinator: true,
            queue_depth: 64,
            max_frame_bytes: 256 * 1024 * 1024,
        }
    }
}
