//! Allocation counters.
//!
//! Plain atomics for the hot counters and a small mutex-protected map for
//! failures by reason. Nothing here resets; the exposition is cumulative.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::registry::Identifier;

/// Counters for one controller.
#[derive(Debug)]
pub struct AllocationMetrics {
    identifier: Identifier,
    allocations: AtomicU64,
    /// Lost compare-and-commit races on the counter ledger.
    ledger_conflicts: AtomicU64,
    /// Stale base versions on claim status writes.
    status_conflicts: AtomicU64,
    reservations: AtomicU64,
    evictions: AtomicU64,
    deallocations: AtomicU64,
    failures: Mutex<BTreeMap<&'static str, u64>>,
}

/// Point-in-time copy of [`AllocationMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationSnapshot {
    pub controller: String,
    pub allocations: u64,
    pub ledger_conflicts: u64,
    pub status_conflicts: u64,
    pub reservations: u64,
    pub evictions: u64,
    pub deallocations: u64,
    pub failures: BTreeMap<String, u64>,
}

impl AllocationMetrics {
    pub fn new(identifier: Identifier) -> Self {
        Self {
            identifier,
            allocations: AtomicU64::new(0),
            ledger_conflicts: AtomicU64::new(0),
            status_conflicts: AtomicU64::new(0),
            reservations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            failures: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, reason: &'static str) {
        *self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(reason)
            .or_insert(0) += 1;
    }

    pub fn record_ledger_conflict(&self) {
        self.ledger_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status_conflict(&self) {
        self.status_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reservation(&self) {
        self.reservations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_deallocation(&self) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    /// `None` unless the identifier is unique; colliding or unnamed
    /// observers are not published.
    pub fn snapshot(&self) -> Option<AllocationSnapshot> {
        if !self.identifier.is_unique() {
            debug!(identifier = %self.identifier, "metrics not published");
            return None;
        }
        let failures = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        Some(AllocationSnapshot {
            controller: self.identifier.name().to_string(),
            allocations: self.allocations.load(Ordering::Relaxed),
            ledger_conflicts: self.ledger_conflicts.load(Ordering::Relaxed),
            status_conflicts: self.status_conflicts.load(Ordering::Relaxed),
            reservations: self.reservations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{GroupVersionResource, IdentifierRegistry};

    fn test_metrics(registry: &IdentifierRegistry) -> AllocationMetrics {
        let gvr = GroupVersionResource::new("resource.k8s.io", "v1", "resourceclaims");
        AllocationMetrics::new(registry.register("claim-controller", &gvr).unwrap())
    }

    #[test]
    fn counters_accumulate() {
        let registry = IdentifierRegistry::new();
        let m = test_metrics(&registry);
        m.record_allocation();
        m.record_allocation();
        m.record_ledger_conflict();
        m.record_evictions(3);
        m.record_failure("insufficient");
        m.record_failure("insufficient");
        m.record_failure("incomplete");

        let s = m.snapshot().unwrap();
        assert_eq!(s.controller, "claim-controller");
        assert_eq!(s.allocations, 2);
        assert_eq!(s.ledger_conflicts, 1);
        assert_eq!(s.evictions, 3);
        assert_eq!(s.failures.get("insufficient"), Some(&2));
        assert_eq!(s.failures.get("incomplete"), Some(&1));
    }

    #[test]
    fn non_unique_identifier_is_not_published() {
        let m = AllocationMetrics::new(Identifier::default());
        m.record_allocation();
        assert!(m.snapshot().is_none());
    }
}
