//! Eviction planning for `NoExecute` taints.
//!
//! Taints are read from the current catalog, tolerations from the
//! allocation result (the claim's tolerations as they were when it was
//! allocated). For each `NoExecute` taint on an allocated device:
//!
//! - no matching toleration: evict at the time the taint was added,
//! - a matching toleration without `tolerationSeconds`: tolerated forever,
//! - otherwise: evict at `timeAdded + min(tolerationSeconds)`, with
//!   non-positive seconds meaning immediately.

use dra_core::{Claim, ConsumerReference, DeviceId, DeviceTaint, DeviceToleration, TaintEffect};
use tracing::debug;

use crate::pool::PoolCatalog;

/// A `NoExecute` taint the claim does not tolerate indefinitely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntolerableTaint {
    pub device: DeviceId,
    pub taint_key: String,
    /// Unix timestamp (seconds) after which consumers must be gone.
    pub deadline: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionOrder {
    pub claim: String,
    pub consumer: ConsumerReference,
    pub device: DeviceId,
    pub taint_key: String,
    pub deadline: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub taints: Vec<IntolerableTaint>,
    /// One order per (consumer, taint).
    pub orders: Vec<EvictionOrder>,
}

impl EvictionPlan {
    /// Whether an intolerable taint is present. New reservations are
    /// refused while this holds, even with nobody to evict yet.
    pub fn is_scheduled(&self) -> bool {
        !self.taints.is_empty()
    }

    /// Earliest deadline over all taints.
    pub fn deadline(&self) -> Option<u64> {
        self.taints.iter().map(|t| t.deadline).min()
    }

    /// Orders whose deadline has passed.
    pub fn due(&self, now: u64) -> impl Iterator<Item = &EvictionOrder> {
        self.orders.iter().filter(move |o| o.deadline <= now)
    }
}

/// Deadline for one taint, or `None` if tolerated forever.
pub fn deadline_for(taint: &DeviceTaint, tolerations: &[DeviceToleration], now: u64) -> Option<u64> {
    if taint.effect != TaintEffect::NoExecute {
        return None;
    }
    let added = taint.time_added.unwrap_or(now);
    let mut bound: Option<u64> = None;
    for toleration in tolerations.iter().filter(|t| t.tolerates(taint)) {
        let secs = toleration.toleration_seconds?;
        let secs = u64::try_from(secs).unwrap_or(0);
        bound = Some(bound.map_or(secs, |b| b.min(secs)));
    }
    Some(added.saturating_add(bound.unwrap_or(0)))
}

pub fn plan(claim: &Claim, catalog: &PoolCatalog, now: u64) -> EvictionPlan {
    let Some(allocation) = &claim.status.allocation else {
        return EvictionPlan::default();
    };
    let key = claim.key();
    let mut plan = EvictionPlan::default();

    for entry in &allocation.results {
        let id = entry.device_id();
        let Some(found) = catalog.device(&id) else {
            continue;
        };
        for taint in &found.device.taints {
            let Some(deadline) = deadline_for(taint, &entry.tolerations, now) else {
                continue;
            };
            debug!(claim = %key, device = %id, taint = %taint.key, deadline, "intolerable taint");
            for consumer in &claim.status.reserved_for {
                plan.orders.push(EvictionOrder {
                    claim: key.clone(),
                    consumer: consumer.clone(),
                    device: id.clone(),
                    taint_key: taint.key.clone(),
                    deadline,
                });
            }
            plan.taints.push(IntolerableTaint {
                device: id.clone(),
                taint_key: taint.key.clone(),
                deadline,
            });
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::slice;
    use dra_core::{
        AllocationResult, DeviceClaim, DeviceRequestAllocationResult, ObjectMeta, TolerationOperator,
    };

    const T: u64 = 1_700_000_000;

    fn maintenance(effect: TaintEffect) -> DeviceTaint {
        DeviceTaint {
            key: "gpu-maint".to_string(),
            value: String::new(),
            effect,
            time_added: Some(T),
        }
    }

    fn exists(seconds: Option<i64>) -> DeviceToleration {
        DeviceToleration {
            key: "gpu-maint".to_string(),
            operator: TolerationOperator::Exists,
            toleration_seconds: seconds,
            ..Default::default()
        }
    }

    fn allocated(tolerations: Vec<DeviceToleration>) -> Claim {
        let mut claim = Claim::new(ObjectMeta::namespaced("default", "c1"), DeviceClaim::default());
        claim
            .status
            .set_allocation(AllocationResult {
                results: vec![DeviceRequestAllocationResult {
                    request: "gpu".to_string(),
                    driver: "gpu.example.com".to_string(),
                    pool: "p".to_string(),
                    device: "a".to_string(),
                    admin_access: None,
                    tolerations,
                    binding_conditions: Vec::new(),
                    binding_failure_conditions: Vec::new(),
                }],
                config: Vec::new(),
                node_selector: None,
                allocation_timestamp: Some(T - 100),
            })
            .unwrap();
        claim
            .status
            .reserve(ConsumerReference::new("pods", "worker", "uid-1"))
            .unwrap();
        claim
    }

    fn catalog_with(taint: Option<DeviceTaint>) -> PoolCatalog {
        let mut s = slice("s1", "p", 1, 1, &["a"]);
        s.spec.devices[0].taints.extend(taint);
        PoolCatalog::build([s])
    }

    #[test]
    fn toleration_seconds_delay_eviction() {
        let claim = allocated(vec![exists(Some(60))]);
        let plan = plan(&claim, &catalog_with(Some(maintenance(TaintEffect::NoExecute))), T + 1);
        assert_eq!(plan.deadline(), Some(T + 60));
        assert_eq!(plan.orders.len(), 1);
        assert_eq!(plan.orders[0].consumer.uid, "uid-1");
        assert_eq!(plan.due(T + 59).count(), 0);
        assert_eq!(plan.due(T + 60).count(), 1);
    }

    #[test]
    fn untolerated_taint_evicts_immediately() {
        let claim = allocated(Vec::new());
        let plan = plan(&claim, &catalog_with(Some(maintenance(TaintEffect::NoExecute))), T + 5);
        assert_eq!(plan.deadline(), Some(T));
        assert_eq!(plan.due(T + 5).count(), 1);
    }

    #[test]
    fn unbounded_toleration_never_evicts() {
        let claim = allocated(vec![exists(None)]);
        let plan = plan(&claim, &catalog_with(Some(maintenance(TaintEffect::NoExecute))), T);
        assert!(!plan.is_scheduled());
    }

    #[test]
    fn non_positive_seconds_are_immediate() {
        let claim = allocated(vec![exists(Some(-5))]);
        let plan = plan(&claim, &catalog_with(Some(maintenance(TaintEffect::NoExecute))), T);
        assert_eq!(plan.deadline(), Some(T));
    }

    #[test]
    fn shortest_matching_toleration_wins() {
        let claim = allocated(vec![exists(Some(600)), exists(Some(30))]);
        let plan = plan(&claim, &catalog_with(Some(maintenance(TaintEffect::NoExecute))), T);
        assert_eq!(plan.deadline(), Some(T + 30));
    }

    #[test]
    fn no_schedule_taints_do_not_evict() {
        let claim = allocated(Vec::new());
        assert!(!plan(&claim, &catalog_with(Some(maintenance(TaintEffect::NoSchedule))), T).is_scheduled());
        assert!(!plan(&claim, &catalog_with(None), T).is_scheduled());
    }

    #[test]
    fn unallocated_claim_has_nothing_to_evict() {
        let claim = Claim::new(ObjectMeta::namespaced("default", "c1"), DeviceClaim::default());
        assert_eq!(plan(&claim, &catalog_with(None), T), EvictionPlan::default());
    }
}
