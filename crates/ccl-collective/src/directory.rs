use uuid::Uuid;

use ccl_net::RendezvousTable;
use ccl_types::{CclError, Rank, Result};

/// Endpoint of every rank in a group, fixed once rendezvous completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankDirectory {
    rank: Rank,
    group_id: Uuid,
    endpoints: Vec<String>,
}

impl RankDirectory {
    pub fn new(rank: Rank, table: RendezvousTable) -> Result<Self> {
        if rank as usize >= table.endpoints.len() {
            return Err(CclError::Rendezvous(format!(
                "rank {rank} missing from a table of {} endpoints",
                table.endpoints.len()
            )));
        }
        Ok(Self {
            rank,
            group_id: table.group_id,
            endpoints: table.endpoints,
        })
    }

    /// Directory of a single-rank group; nothing is ever dialed.
    pub fn local() -> Self {
        Self {
            rank: 0,
            group_id: Uuid::new_v4(),
            endpoints: vec!["local".to_string()],
        }
    }

    pub fn resolve(&self, rank: Rank) -> Result<&str> {
        self.endpoints
            .get(rank as usize)
            .map(String::as_str)
            .ok_or_else(|| {
                CclError::InvalidArgument(format!(
                    "rank {rank} out of range for world size {}",
                    self.world_size()
                ))
            })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.endpoints.len() as u32
    }

    pub fn group_id(&self) -> Uuid {
        self.group_id
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}
