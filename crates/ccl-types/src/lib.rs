pub mod buffer;
pub mod collective;
pub mod config;
pub mod error;
pub mod wire;

pub use buffer::{is_available, Buffer, BufferDescriptor, DataType, Device};
pub use collective::{
    CollectiveKind, CollectiveOutput, CollectiveRequest, CollectiveSignature, ReduceOp,
};
pub use config::{EnvConfig, GroupOptions};
pub use error::{CclError, Result};

/// A participant's identity within a process group, in `[0, world_size)`.
pub type Rank = u32;
