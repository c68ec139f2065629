//! Pool consistency.
//!
//! Slices are grouped by (driver, pool). Only slices at the highest
//! generation observed for a pool count; older generations are stale
//! leftovers of a driver update in progress. A pool is usable only when the
//! number of distinct slices at that generation equals the slice count they
//! declare.
//!
//! ```text
//!  slices ──group──▶ (driver,pool) ──max gen──▶ count == sliceCount ? Complete
//!                                                                   : Incomplete
//! ```
//!
//! The maximum is taken over what is observed now, not over history, so a
//! pool whose generation was reset becomes usable again once all of its new
//! slices are visible.

use std::collections::{BTreeMap, HashSet};

use dra_core::{Device, DeviceId, PoolId, Quantity, Slice};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolState {
    Complete,
    /// Not yet converged. Allocation touching the pool is deferred.
    Incomplete { expected: i64, observed: usize },
    /// Converged but inconsistent (duplicate device or counter set names).
    Invalid { reason: String },
}

/// One pool at its current generation.
#[derive(Debug, Clone)]
pub struct PoolView {
    pub id: PoolId,
    pub generation: i64,
    pub slices: Vec<Slice>,
    pub state: PoolState,
}

/// A device together with the slice that published it.
#[derive(Debug, Clone, Copy)]
pub struct CatalogDevice<'a> {
    pub slice: &'a Slice,
    pub device: &'a Device,
}

impl CatalogDevice<'_> {
    pub fn id(&self) -> DeviceId {
        self.slice.device_id(self.device)
    }
}

impl PoolView {
    pub fn is_complete(&self) -> bool {
        self.state == PoolState::Complete
    }

    pub fn devices(&self) -> impl Iterator<Item = CatalogDevice<'_>> {
        self.slices.iter().flat_map(|slice| {
            slice
                .spec
                .devices
                .iter()
                .map(move |device| CatalogDevice { slice, device })
        })
    }

    /// Declared quantity of a shared counter.
    pub fn counter_limit(&self, set: &str, counter: &str) -> Option<&Quantity> {
        self.slices
            .iter()
            .find_map(|s| s.counter_set(set))
            .and_then(|s| s.counters.get(counter))
            .map(|c| &c.value)
    }

    fn check_consistency(&self) -> Option<String> {
        let mut devices = HashSet::new();
        let mut sets = HashSet::new();
        for slice in &self.slices {
            for d in &slice.spec.devices {
                if !devices.insert(d.name.as_str()) {
                    return Some(format!("device {} published twice", d.name));
                }
            }
            for s in &slice.spec.shared_counters {
                if !sets.insert(s.name.as_str()) {
                    return Some(format!("counter set {} published twice", s.name));
                }
            }
        }
        None
    }
}

/// Point-in-time view of all pools.
#[derive(Debug, Clone, Default)]
pub struct PoolCatalog {
    pools: BTreeMap<PoolId, PoolView>,
}

impl PoolCatalog {
    pub fn build(slices: impl IntoIterator<Item = Slice>) -> Self {
        let mut grouped: BTreeMap<PoolId, Vec<Slice>> = BTreeMap::new();
        for slice in slices {
            grouped.entry(slice.pool_id()).or_default().push(slice);
        }

        let mut pools = BTreeMap::new();
        for (id, slices) in grouped {
            let generation = slices
                .iter()
                .map(|s| s.spec.pool.generation)
                .max()
                .unwrap_or_default();
            // Distinct slice names at the current generation.
            let mut current: BTreeMap<String, Slice> = BTreeMap::new();
            for s in slices.into_iter().filter(|s| s.spec.pool.generation == generation) {
                current.insert(s.metadata.name.clone(), s);
            }
            let slices: Vec<Slice> = current.into_values().collect();

            let counts: HashSet<i64> = slices.iter().map(|s| s.spec.pool.resource_slice_count).collect();
            let expected = counts.iter().copied().max().unwrap_or_default();
            let observed = slices.len();

            let mut view = PoolView {
                id: id.clone(),
                generation,
                slices,
                state: PoolState::Complete,
            };
            view.state = if counts.len() != 1 || observed as i64 != expected {
                PoolState::Incomplete { expected, observed }
            } else if let Some(reason) = view.check_consistency() {
                PoolState::Invalid { reason }
            } else {
                PoolState::Complete
            };
            debug!(pool = %id, generation, expected, observed, state = ?view.state, "pool evaluated");
            pools.insert(id, view);
        }
        Self { pools }
    }

    pub fn pool(&self, driver: &str, name: &str) -> Option<&PoolView> {
        self.pools.get(&PoolId::new(driver, name))
    }

    pub fn pools(&self) -> impl Iterator<Item = &PoolView> {
        self.pools.values()
    }

    /// Devices of complete pools, in pool then slice order.
    pub fn allocatable_devices(&self) -> impl Iterator<Item = CatalogDevice<'_>> {
        self.pools
            .values()
            .filter(|p| p.is_complete())
            .flat_map(|p| p.devices())
    }

    pub fn incomplete_pools(&self) -> Vec<&PoolId> {
        self.pools
            .values()
            .filter(|p| matches!(p.state, PoolState::Incomplete { .. }))
            .map(|p| &p.id)
            .collect()
    }

    /// Look up a device at its pool's current generation, complete or not.
    pub fn device(&self, id: &DeviceId) -> Option<CatalogDevice<'_>> {
        self.pools
            .get(&id.pool_id())?
            .devices()
            .find(|d| d.device.name == id.device)
    }
}
