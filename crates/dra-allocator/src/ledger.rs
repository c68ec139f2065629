//! Device and counter accounting.
//!
//! The allocator works against a [`LedgerSnapshot`] and produces a
//! [`CommitPlan`]. The plan is applied to the [`SharedLedger`] with a
//! compare-and-commit: headroom and device availability are re-checked
//! under the lock, so two claims racing for the same counter set cannot
//! both win. The loser gets a [`LedgerConflict`] and must retry against a
//! fresh snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use dra_core::{AllocationResult, DeviceId, PoolId, Quantity};
use thiserror::Error;
use tracing::debug;

use crate::pool::PoolCatalog;

/// A counter within a pool's counter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    pub pool: PoolId,
    pub set: String,
    pub counter: String,
}

/// Committed usage at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    /// Devices held by a non-admin allocation.
    pub devices_in_use: HashSet<DeviceId>,
    pub consumed: HashMap<CounterKey, Quantity>,
}

impl LedgerSnapshot {
    pub fn consumed(&self, key: &CounterKey) -> Quantity {
        self.consumed.get(key).cloned().unwrap_or_default()
    }
}

/// Consumption of one counter by an allocation, with the limit it was
/// checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterCharge {
    pub key: CounterKey,
    pub amount: Quantity,
    pub limit: Quantity,
}

/// What one allocation takes from the shared ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPlan {
    /// Claim key or uid owning the resources.
    pub owner: String,
    pub devices: Vec<DeviceId>,
    pub charges: Vec<CounterCharge>,
}

impl CommitPlan {
    /// Recompute the plan of an existing allocation from the catalog.
    /// Admin-access entries hold neither devices nor counters.
    pub fn for_result(owner: &str, result: &AllocationResult, catalog: &PoolCatalog) -> Self {
        let mut devices = Vec::new();
        let mut totals: BTreeMap<CounterKey, (Quantity, Quantity)> = BTreeMap::new();
        for entry in result.results.iter().filter(|r| !r.admin_access()) {
            let id = entry.device_id();
            let pool_id = id.pool_id();
            if let (Some(found), Some(pool)) =
                (catalog.device(&id), catalog.pool(&pool_id.driver, &pool_id.pool))
            {
                for consumption in &found.device.consumes_counters {
                    for (counter, c) in &consumption.counters {
                        let key = CounterKey {
                            pool: pool_id.clone(),
                            set: consumption.counter_set.clone(),
                            counter: counter.clone(),
                        };
                        let limit = pool
                            .counter_limit(&consumption.counter_set, counter)
                            .cloned()
                            .unwrap_or_default();
                        let slot = totals.entry(key).or_insert((Quantity::ZERO, limit));
                        slot.0 = slot.0.checked_add(&c.value).unwrap_or_else(|| slot.0.clone());
                    }
                }
            }
            devices.push(id);
        }
        Self {
            owner: owner.to_string(),
            devices,
            charges: totals
                .into_iter()
                .map(|(key, (amount, limit))| CounterCharge { key, amount, limit })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerConflict {
    #[error("device {0} is already allocated")]
    DeviceInUse(DeviceId),

    #[error("counter {counter} of set {set} in pool {pool} exhausted: {consumed} + {amount} > {limit}")]
    CounterExhausted {
        pool: PoolId,
        set: String,
        counter: String,
        consumed: Quantity,
        amount: Quantity,
        limit: Quantity,
    },

    #[error("{0} already holds an allocation")]
    AlreadyHeld(String),
}

#[derive(Debug, Default)]
struct LedgerState {
    snapshot: LedgerSnapshot,
    held: HashMap<String, CommitPlan>,
}

/// Process-wide ledger of committed device and counter usage.
#[derive(Debug, Default)]
pub struct SharedLedger {
    inner: Mutex<LedgerState>,
}

impl SharedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored allocations, e.g. on startup.
    pub fn from_allocations<'a>(
        allocations: impl IntoIterator<Item = (&'a str, &'a AllocationResult)>,
        catalog: &PoolCatalog,
    ) -> Self {
        let ledger = Self::new();
        {
            let mut state = ledger.lock();
            for (owner, result) in allocations {
                let plan = CommitPlan::for_result(owner, result, catalog);
                apply(&mut state.snapshot, &plan);
                state.held.insert(owner.to_string(), plan);
            }
        }
        ledger
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // The state is only mutated after all checks pass, so a poisoned
        // lock still guards a consistent value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.lock().snapshot.clone()
    }

    /// Apply `plan` if every device is still free and every counter still
    /// has headroom.
    pub fn commit(&self, plan: &CommitPlan) -> Result<(), LedgerConflict> {
        let mut state = self.lock();
        if state.held.contains_key(&plan.owner) {
            return Err(LedgerConflict::AlreadyHeld(plan.owner.clone()));
        }
        for device in &plan.devices {
            if state.snapshot.devices_in_use.contains(device) {
                return Err(LedgerConflict::DeviceInUse(device.clone()));
            }
        }
        for charge in &plan.charges {
            let consumed = state.snapshot.consumed(&charge.key);
            let fits = consumed
                .checked_add(&charge.amount)
                .is_some_and(|total| total <= charge.limit);
            if !fits {
                return Err(LedgerConflict::CounterExhausted {
                    pool: charge.key.pool.clone(),
                    set: charge.key.set.clone(),
                    counter: charge.key.counter.clone(),
                    consumed,
                    amount: charge.amount.clone(),
                    limit: charge.limit.clone(),
                });
            }
        }
        apply(&mut state.snapshot, plan);
        state.held.insert(plan.owner.clone(), plan.clone());
        debug!(
            owner = %plan.owner,
            devices = plan.devices.len(),
            charges = plan.charges.len(),
            "ledger commit"
        );
        Ok(())
    }

    /// Return everything held by `owner`.
    pub fn release(&self, owner: &str) -> Option<CommitPlan> {
        let mut state = self.lock();
        let plan = state.held.remove(owner)?;
        for device in &plan.devices {
            state.snapshot.devices_in_use.remove(device);
        }
        for charge in &plan.charges {
            if let Some(consumed) = state.snapshot.consumed.get_mut(&charge.key) {
                *consumed = consumed.saturating_sub(&charge.amount);
                if consumed.is_zero() {
                    state.snapshot.consumed.remove(&charge.key);
                }
            }
        }
        debug!(%owner, devices = plan.devices.len(), "ledger release");
        Some(plan)
    }

    pub fn holds(&self, owner: &str) -> bool {
        self.lock().held.contains_key(owner)
    }
}

fn apply(snapshot: &mut LedgerSnapshot, plan: &CommitPlan) {
    snapshot.devices_in_use.extend(plan.devices.iter().cloned());
    for charge in &plan.charges {
        let slot = snapshot.consumed.entry(charge.key.clone()).or_default();
        *slot = slot.checked_add(&charge.amount).unwrap_or_else(|| slot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CounterKey {
        CounterKey {
            pool: PoolId::new("gpu.example.com", "node-1"),
            set: "mem-slices".to_string(),
            counter: "memory".to_string(),
        }
    }

    fn plan(owner: &str, device: &str, amount: i64) -> CommitPlan {
        CommitPlan {
            owner: owner.to_string(),
            devices: vec![DeviceId::new("gpu.example.com", "node-1", device)],
            charges: vec![CounterCharge {
                key: key(),
                amount: Quantity::from_int(amount),
                limit: Quantity::from_int(32),
            }],
        }
    }

    #[test]
    fn commit_within_limit() {
        let ledger = SharedLedger::new();
        ledger.commit(&plan("a", "mig-0", 12)).unwrap();
        ledger.commit(&plan("b", "mig-1", 20)).unwrap();
        assert_eq!(ledger.snapshot().consumed(&key()), Quantity::from_int(32));
    }

    #[test]
    fn commit_over_limit_conflicts() {
        let ledger = SharedLedger::new();
        ledger.commit(&plan("a", "mig-0", 20)).unwrap();
        let err = ledger.commit(&plan("b", "mig-1", 20)).unwrap_err();
        assert!(matches!(err, LedgerConflict::CounterExhausted { .. }));
        assert_eq!(ledger.snapshot().consumed(&key()), Quantity::from_int(20));
    }

    #[test]
    fn device_cannot_be_committed_twice() {
        let ledger = SharedLedger::new();
        ledger.commit(&plan("a", "mig-0", 1)).unwrap();
        assert!(matches!(
            ledger.commit(&plan("b", "mig-0", 1)),
            Err(LedgerConflict::DeviceInUse(_))
        ));
    }

    #[test]
    fn release_returns_capacity() {
        let ledger = SharedLedger::new();
        ledger.commit(&plan("a", "mig-0", 20)).unwrap();
        assert!(ledger.release("a").is_some());
        assert!(ledger.release("a").is_none());
        let snapshot = ledger.snapshot();
        assert!(snapshot.devices_in_use.is_empty());
        assert_eq!(snapshot.consumed(&key()), Quantity::ZERO);
        ledger.commit(&plan("b", "mig-0", 20)).unwrap();
    }

    #[test]
    fn concurrent_commits_never_exceed_limit() {
        let ledger = std::sync::Arc::new(SharedLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.commit(&plan(&format!("c{i}"), &format!("mig-{i}"), 20)).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(ledger.snapshot().consumed(&key()), Quantity::from_int(20));
        assert_eq!(ledger.snapshot().devices_in_use.len(), 1);
    }
}
