//! Process-wide default group, for embedders that expose one.
//!
//! Forming a group takes a full rendezvous, so initialization reserves the
//! slot first, forms the group without holding any lock, then installs it.
//! A second initialization fails while the first is still in flight, and a
//! failed one frees the slot when its reservation drops.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use ccl_types::{CclError, Result};

use crate::group::ProcessGroup;

enum Slot {
    Empty,
    Reserved,
    Ready(Arc<ProcessGroup>),
}

pub struct DefaultGroup {
    slot: Mutex<Slot>,
}

impl DefaultGroup {
    pub const fn new() -> Self {
        Self { slot: Mutex::new(Slot::Empty) }
    }

    /// Claim the slot for a group about to be formed.
    pub fn reserve(&self) -> Result<Reservation<'_>> {
        let mut slot = self.lock();
        match *slot {
            Slot::Empty => {
                *slot = Slot::Reserved;
                Ok(Reservation { owner: self, installed: false })
            }
            Slot::Reserved => Err(CclError::InvalidState(
                "default process group is already being initialized".into(),
            )),
            Slot::Ready(_) => Err(CclError::InvalidState(
                "default process group already initialized; destroy it first".into(),
            )),
        }
    }

    pub fn get(&self) -> Result<Arc<ProcessGroup>> {
        match &*self.lock() {
            Slot::Ready(group) => Ok(group.clone()),
            _ => Err(CclError::InvalidState("default process group is not initialized".into())),
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.lock(), Slot::Ready(_))
    }

    /// Empty the slot if it holds `group`. Returns whether it did.
    pub fn clear_if(&self, group: &Arc<ProcessGroup>) -> bool {
        let mut slot = self.lock();
        match &*slot {
            Slot::Ready(current) if Arc::ptr_eq(current, group) => {
                *slot = Slot::Empty;
                true
            }
            _ => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for DefaultGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the default slot while a group is formed.
pub struct Reservation<'a> {
    owner: &'a DefaultGroup,
    installed: bool,
}

impl Reservation<'_> {
    pub fn install(mut self, group: Arc<ProcessGroup>) {
        info!(rank = group.rank(), world_size = group.world_size(), "default process group set");
        *self.owner.lock() = Slot::Ready(group);
        self.installed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.installed {
            return;
        }
        let mut slot = self.owner.lock();
        if matches!(*slot, Slot::Reserved) {
            *slot = Slot::Empty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use ccl_net::TransportRegistry;
    use ccl_types::{EnvConfig, GroupOptions};

    async fn solo() -> Arc<ProcessGroup> {
        let env = EnvConfig::from_lookup(Path::new("/opt/ccl"), |_| None);
        let pg = ProcessGroup::create(GroupOptions::default(), &env, &TransportRegistry::empty())
            .await
            .unwrap();
        Arc::new(pg)
    }

    #[test]
    fn second_init_fails_while_first_is_in_flight() {
        let slot = DefaultGroup::new();
        let first = slot.reserve().unwrap();
        assert!(matches!(slot.reserve(), Err(CclError::InvalidState(_))));
        assert!(!slot.is_initialized());
        assert!(slot.get().is_err());

        // A failed initialization frees the slot.
        drop(first);
        assert!(slot.reserve().is_ok());
    }

    #[tokio::test]
    async fn installed_group_is_the_default_until_cleared() {
        let slot = DefaultGroup::new();
        let pg = solo().await;
        slot.reserve().unwrap().install(pg.clone());

        assert!(slot.is_initialized());
        assert!(Arc::ptr_eq(&slot.get().unwrap(), &pg));
        assert!(matches!(slot.reserve(), Err(CclError::InvalidState(_))));

        let other = solo().await;
        assert!(!slot.clear_if(&other));
        assert!(slot.clear_if(&pg));
        assert!(!slot.is_initialized());

        pg.destroy().await.unwrap();
        other.destroy().await.unwrap();
    }
}
