//! Shared cluster topology manager
//!
//! Holds the current slot map snapshot and decides when it must be rebuilt.
//! Readers clone the `Arc`; writers build a new map and swap the pointer, so
//! a snapshot handed out never changes underneath its holder.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::node::NodeAddress;
use super::slot_map::SlotMap;
use super::topology::{HostTranslation, RefreshAttempt};
use crate::config::ClusterConfig;
use crate::utils::Result;

/// Shared topology manager for cluster mode
pub struct TopologyManager {
    /// Current cluster topology
    slot_map: RwLock<Arc<SlotMap>>,

    /// Seed addresses for topology discovery
    seeds: Vec<NodeAddress>,

    translation: HostTranslation,

    /// Whether a refresh is currently in progress (prevents concurrent refreshes)
    is_refreshing: AtomicBool,

    /// Set by CLUSTERDOWN and by the MOVED threshold; cleared by install
    stale: AtomicBool,

    moved_since_refresh: AtomicU32,

    /// MOVED count that forces a full refresh (0 disables)
    refresh_after_moved: u32,

    refresh_interval: Option<Duration>,
}

impl TopologyManager {
    /// Create new topology manager with an empty map
    pub fn new(seeds: Vec<NodeAddress>, translation: HostTranslation) -> Self {
        Self {
            slot_map: RwLock::new(Arc::new(SlotMap::empty())),
            seeds,
            translation,
            is_refreshing: AtomicBool::new(false),
            stale: AtomicBool::new(false),
            moved_since_refresh: AtomicU32::new(0),
            refresh_after_moved: 0,
            refresh_interval: None,
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.seeds.clone(), config.host_translation.clone())
            .with_refresh_policy(config.refresh_after_moved, config.refresh_interval)
    }

    pub fn with_refresh_policy(
        mut self,
        refresh_after_moved: u32,
        refresh_interval: Option<Duration>,
    ) -> Self {
        self.refresh_after_moved = refresh_after_moved;
        self.refresh_interval = refresh_interval;
        self
    }

    pub fn seeds(&self) -> &[NodeAddress] {
        &self.seeds
    }

    pub fn translation(&self) -> &HostTranslation {
        &self.translation
    }

    /// Map an announced address to a reachable one
    pub fn translate(&self, address: &NodeAddress) -> NodeAddress {
        self.translation.translate(address)
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<SlotMap> {
        Arc::clone(&self.slot_map.read())
    }

    /// Get current topology version
    pub fn epoch(&self) -> u64 {
        self.slot_map.read().epoch()
    }

    /// Replace the whole map with a freshly fetched one
    pub fn install(&self, map: SlotMap) -> Arc<SlotMap> {
        let mut current = self.slot_map.write();
        let map = Arc::new(map.with_epoch(current.epoch() + 1));
        info!(
            "Cluster topology refreshed: {} primaries, {} total nodes, epoch {}",
            map.primaries().count(),
            map.nodes().len(),
            map.epoch()
        );
        *current = Arc::clone(&map);
        drop(current);

        self.moved_since_refresh.store(0, Ordering::Relaxed);
        self.stale.store(false, Ordering::Release);
        map
    }

    /// Record a MOVED redirect: reassign the slot in a new snapshot.
    ///
    /// Returns true once enough redirects have accumulated that a full
    /// refresh is due.
    pub fn apply_moved(&self, slot: u16, node: &NodeAddress) -> bool {
        {
            let mut current = self.slot_map.write();
            if let Some(next) = current.with_moved(slot, node) {
                debug!(
                    "Slot {} moved to {}, epoch {} -> {}",
                    slot,
                    node,
                    current.epoch(),
                    next.epoch()
                );
                *current = Arc::new(next);
            }
        }

        if self.refresh_after_moved == 0 {
            return false;
        }
        let seen = self.moved_since_refresh.fetch_add(1, Ordering::Relaxed) + 1;
        if seen >= self.refresh_after_moved {
            self.stale.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Force a full refresh on the next call
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Whether the map is empty, marked stale, or older than the refresh interval
    pub fn needs_refresh(&self) -> bool {
        let map = self.snapshot();
        if map.is_empty() || self.is_stale() {
            return true;
        }
        matches!(self.refresh_interval, Some(interval) if map.age() >= interval)
    }

    /// Claim the refresh slot; `None` if another caller holds it
    pub fn try_begin_refresh(&self) -> Option<RefreshGuard<'_>> {
        self.is_refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshGuard {
                flag: &self.is_refreshing,
            })
    }

    pub fn is_refreshing(&self) -> bool {
        self.is_refreshing.load(Ordering::Acquire)
    }

    /// Refresh a caller should run before routing, if one is due.
    ///
    /// Only the caller holding the refresh guard refreshes, except when the
    /// map is empty: then there is nothing to route with, so everyone does.
    pub fn due_refresh(&self) -> Option<DueRefresh<'_>> {
        if !self.needs_refresh() {
            return None;
        }
        let guard = self.try_begin_refresh();
        let required = self.snapshot().is_empty();
        if guard.is_none() && !required {
            return None;
        }
        Some(DueRefresh {
            _guard: guard,
            required,
            epoch: self.epoch(),
        })
    }

    /// Candidate walk over seeds and the current primaries
    pub fn refresh_attempt(&self) -> RefreshAttempt {
        RefreshAttempt::new(&self.seeds, &self.snapshot())
    }
}

/// Releases the refresh slot on drop
pub struct RefreshGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// A refresh claimed through [`TopologyManager::due_refresh`]
pub struct DueRefresh<'a> {
    _guard: Option<RefreshGuard<'a>>,
    required: bool,
    epoch: u64,
}

impl DueRefresh<'_> {
    /// Whether routing cannot proceed if the refresh fails
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Settle the refresh; a failure is swallowed while an older map exists
    pub fn finish<T>(self, result: Result<T>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(e) if self.required => Err(e),
            Err(e) => {
                warn!(
                    "Topology refresh failed, keeping epoch {}: {}",
                    self.epoch, e
                );
                Ok(())
            }
        }
    }
}
