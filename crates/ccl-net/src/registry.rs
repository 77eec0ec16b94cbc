// ccl-net::registry: transport providers keyed by name.
//
// Providers are registered explicitly in code. Deployments can add aliases
// by dropping JSON manifests into the provider search path:
//
//   { "name": "ofi", "implementation": "tcp", "abi_version": 1 }
//
// A manifest never introduces new code; it only maps a name onto a provider
// that is already compiled in.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ccl_types::config::{EnvConfig, DEFAULT_TRANSPORT};
use ccl_types::{CclError, Result};

use crate::mem::{MemFabric, MemProvider, MEM_PROVIDER};
use crate::tcp::{TcpProvider, TCP_PROVIDER};
use crate::transport::{BoxedStream, Listener, TransportProvider};

/// Manifest ABI understood by this build.
pub const PROVIDER_ABI_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderManifest {
    /// Name the provider is selected by.
    pub name: String,
    /// Registered provider that backs it.
    pub implementation: String,
    pub abi_version: u32,
}

// ── Registry ─────────────────────────────────────────────────────────────────

pub struct TransportRegistry {
    providers: HashMap<String, Arc<dyn TransportProvider>>,
    default: String,
}

impl TransportRegistry {
    /// No providers at all; every `resolve` yields [`UnavailableProvider`].
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
            default: DEFAULT_TRANSPORT.to_string(),
        }
    }

    /// The `tcp` provider.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(TCP_PROVIDER, Arc::new(TcpProvider));
        registry
    }

    /// Built-ins plus a `mem` provider over `fabric`.
    pub fn with_fabric(fabric: Arc<MemFabric>) -> Self {
        let mut registry = Self::with_builtins();
        registry.register(MEM_PROVIDER, Arc::new(MemProvider::new(fabric)));
        registry
    }

    /// Built-ins plus any manifests found on the configured search path.
    pub fn from_env(env: &EnvConfig) -> Self {
        let mut registry = Self::with_builtins();
        registry.load_manifests(&env.provider_search_path);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn TransportProvider>) {
        let name = name.into();
        debug!(%name, implementation = provider.name(), "registered transport provider");
        self.providers.insert(name, provider);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register every valid `*.json` manifest in `dir` as an alias.
    /// Returns the number of aliases added. Bad manifests are logged and
    /// skipped; a missing directory is not an error.
    pub fn load_manifests(&mut self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "provider search path does not exist");
                return 0;
            }
            Err(e) => {
                warn!(dir = %dir.display(), %e, "cannot scan provider search path");
                return 0;
            }
        };

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut added = 0;
        for path in paths {
            match self.load_manifest(&path) {
                Ok(name) => {
                    info!(%name, path = %path.display(), "loaded transport provider manifest");
                    added += 1;
                }
                Err(e) => warn!(path = %path.display(), %e, "skipping provider manifest"),
            }
        }
        added
    }

    fn load_manifest(&mut self, path: &Path) -> Result<String> {
        let text = std::fs::read_to_string(path)?;
        let manifest: ProviderManifest = serde_json::from_str(&text)
            .map_err(|e| CclError::Config(format!("malformed manifest: {e}")))?;

        if manifest.abi_version != PROVIDER_ABI_VERSION {
            return Err(CclError::Config(format!(
                "abi_version {} does not match {PROVIDER_ABI_VERSION}",
                manifest.abi_version
            )));
        }
        if manifest.name.is_empty() {
            return Err(CclError::Config("manifest has an empty name".into()));
        }
        if self.contains(&manifest.name) {
            return Err(CclError::Config(format!(
                "provider '{}' is already registered",
                manifest.name
            )));
        }
        let provider = self
            .providers
            .get(&manifest.implementation)
            .cloned()
            .ok_or_else(|| {
                CclError::Config(format!(
                    "unknown implementation '{}'",
                    manifest.implementation
                ))
            })?;

        self.register(manifest.name.clone(), provider);
        Ok(manifest.name)
    }

    /// The provider registered as `name`, else the default provider, else
    /// [`UnavailableProvider`].
    pub fn resolve(&self, name: &str) -> Arc<dyn TransportProvider> {
        if let Some(provider) = self.providers.get(name) {
            return provider.clone();
        }
        match self.providers.get(&self.default) {
            Some(provider) => {
                warn!(requested = %name, fallback = %self.default, "unknown transport provider, falling back");
                provider.clone()
            }
            None => {
                warn!(requested = %name, "no usable transport provider");
                Arc::new(UnavailableProvider)
            }
        }
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("providers", &self.names())
            .field("default", &self.default)
            .finish()
    }
}

// ── Unavailable ──────────────────────────────────────────────────────────────

pub const UNAVAILABLE_PROVIDER: &str = "unavailable";

/// Stand-in when no provider can be loaded. Every operation fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableProvider;

#[async_trait]
impl TransportProvider for UnavailableProvider {
    fn name(&self) -> &str {
        UNAVAILABLE_PROVIDER
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn listen(&self, _bind_host: &str) -> Result<Box<dyn Listener>> {
        Err(CclError::transport(None, "no transport provider is available"))
    }

    async fn dial(&self, endpoint: &str) -> io::Result<BoxedStream> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no transport provider is available to reach {endpoint}"),
        ))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
