// ── Module declarations ───────────────────────────────────────────────────────

pub mod codec;
pub mod events;
pub mod link;
pub mod mem;
pub mod mesh;
pub mod registry;
pub mod rendezvous;
pub mod tcp;
pub mod transport;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use codec::DEFAULT_MAX_FRAME_BYTES;
pub use events::LinkEvent;
pub use link::{Inbound, Link};
pub use mem::{MemFabric, MemProvider, MEM_PROVIDER};
pub use mesh::{LinkSet, MeshConfig};
pub use registry::{
    ProviderManifest, TransportRegistry, UnavailableProvider, PROVIDER_ABI_VERSION,
};
pub use rendezvous::{check_in, RendezvousServer, RendezvousTable};
pub use tcp::{TcpProvider, TCP_PROVIDER};
pub use transport::{dial_with_retry, BoxedStream, Listener, PeerStream, TransportProvider};
