//! Claim controller: drives claims through their lifecycle.
//!
//! Every transition reads the claim, decides, and writes the status back
//! with a compare-and-swap on the version that was read:
//!
//! - `allocate` runs the allocator against a fresh catalog and ledger
//!   snapshot, commits the plan to the shared ledger, then stores the
//!   result. A lost ledger race or a stale claim version retries from a
//!   fresh read, up to `max_attempts`.
//! - `reserve` adds a consumer once binding conditions hold and no
//!   intolerable taint is present.
//! - `deallocate` clears the result and returns devices and counters.
//! - `sweep_evictions` removes consumers whose `NoExecute` deadline passed.
//!
//! At most one transition is in flight per claim; different claims proceed
//! concurrently and meet only at the ledger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dra_allocator::{
    AllocationTarget, Allocator, BasicEvaluator, BindingGate, BindingOutcome, EvictionOrder, EvictionPlan,
    PoolCatalog, SelectorEvaluator, SharedLedger, eviction,
};
use dra_core::config::AllocatorConfig;
use dra_core::{AllocatedDeviceStatus, AllocationResult, Claim, ConsumerReference, DeviceClass, NodeInfo};
use dra_metrics::AllocationMetrics;
use dra_store::{SliceFilter, StateError, StateStore};
use tokio::sync::{OwnedMutexGuard, watch};
use tracing::{debug, error, info, warn};

use crate::error::{ControllerError, ControllerResult};

/// Outcome of one eviction sweep.
#[derive(Debug, Default)]
pub struct EvictionSweep {
    /// Orders carried out.
    pub evicted: Vec<EvictionOrder>,
    /// Claims whose consumers could not be removed. Their orders stay due.
    pub failed: Vec<SweepFailure>,
}

impl EvictionSweep {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub struct SweepFailure {
    pub claim: String,
    pub error: ControllerError,
}

pub struct ClaimController<E = BasicEvaluator> {
    store: StateStore,
    ledger: SharedLedger,
    allocator: Allocator<E>,
    config: AllocatorConfig,
    metrics: Arc<AllocationMetrics>,
    /// One async mutex per claim key.
    claim_locks: ClaimLocks,
}

impl<E: SelectorEvaluator> ClaimController<E> {
    /// Create a controller. The ledger is rebuilt from the allocations
    /// already in the store.
    pub fn new(
        store: StateStore,
        evaluator: E,
        config: AllocatorConfig,
        metrics: Arc<AllocationMetrics>,
    ) -> ControllerResult<Self> {
        let catalog = PoolCatalog::build(store.list_slices(&SliceFilter::default())?);
        let claims = store.list_claims()?;
        let allocated: Vec<(String, &AllocationResult)> = claims
            .iter()
            .filter_map(|c| c.status.allocation.as_ref().map(|a| (c.key(), a)))
            .collect();
        let ledger = SharedLedger::from_allocations(allocated.iter().map(|(k, a)| (k.as_str(), *a)), &catalog);
        info!(allocated = allocated.len(), "claim controller ready");

        Ok(Self {
            store,
            ledger,
            allocator: Allocator::new(evaluator),
            config,
            metrics,
            claim_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn metrics(&self) -> &AllocationMetrics {
        &self.metrics
    }

    /// Allocate devices for `key`. Already-allocated claims are returned
    /// unchanged. `node` defaults to the configured node name.
    pub async fn allocate(&self, key: &str, node: Option<NodeInfo>) -> ControllerResult<Claim> {
        let _guard = self.lock_claim(key).await;

        let node = node.or_else(|| self.config.node_name.as_deref().map(NodeInfo::new));
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            let claim = self.load_claim(key)?;
            if claim.status.allocation.is_some() {
                debug!(claim = %key, "already allocated");
                return Ok(claim);
            }

            let catalog = self.catalog()?;
            let classes = self.classes()?;
            let target = AllocationTarget {
                node: node.clone(),
                now: epoch_secs(),
            };
            let allocation = match self
                .allocator
                .allocate(&claim, &classes, &catalog, &self.ledger.snapshot(), &target)
            {
                Ok(a) => a,
                Err(e) => {
                    self.metrics.record_failure(e.reason());
                    return Err(e.into());
                }
            };

            if let Err(conflict) = self.ledger.commit(&allocation.plan) {
                self.metrics.record_ledger_conflict();
                warn!(claim = %key, attempt, error = %conflict, "ledger conflict, retrying");
                self.backoff(attempt).await;
                continue;
            }

            let mut status = claim.status.clone();
            if let Err(e) = status.set_allocation(allocation.result) {
                self.ledger.release(key);
                return Err(e.into());
            }
            match self
                .store
                .update_claim_status(key, claim.metadata.resource_version, &status)
            {
                Ok(stored) => {
                    self.metrics.record_allocation();
                    info!(claim = %key, attempt, "claim allocated");
                    return Ok(stored);
                }
                Err(e) if e.is_retryable() => {
                    self.ledger.release(key);
                    self.metrics.record_status_conflict();
                    warn!(claim = %key, attempt, error = %e, "stale claim, retrying");
                    self.backoff(attempt).await;
                }
                Err(e) => {
                    self.ledger.release(key);
                    return Err(e.into());
                }
            }
        }

        self.metrics.record_failure("retries_exhausted");
        Err(ControllerError::RetriesExhausted {
            key: key.to_string(),
            attempts,
        })
    }

    /// Add `consumer` to `reservedFor`.
    pub async fn reserve(&self, key: &str, consumer: ConsumerReference) -> ControllerResult<Claim> {
        let _guard = self.lock_claim(key).await;
        let base = self.load_claim(key)?;
        self.reserve_on(base, consumer)
    }

    /// Reserve against `base` as read by the caller. If the claim changed
    /// since, the write fails with a retryable conflict and the caller
    /// re-queues with a fresh read.
    pub async fn reserve_from(&self, base: Claim, consumer: ConsumerReference) -> ControllerResult<Claim> {
        let _guard = self.lock_claim(&base.key()).await;
        self.reserve_on(base, consumer)
    }

    fn reserve_on(&self, base: Claim, consumer: ConsumerReference) -> ControllerResult<Claim> {
        let key = base.key();
        let Some(allocation) = &base.status.allocation else {
            return Err(dra_core::StatusError::NotAllocated.into());
        };

        let now = epoch_secs();
        let plan = eviction::plan(&base, &self.catalog()?, now);
        if let Some(deadline) = plan.deadline() {
            warn!(claim = %key, deadline, "reservation refused, intolerable taint");
            return Err(ControllerError::EvictionScheduled { key, deadline });
        }

        match BindingGate::check(allocation, &base.status.devices) {
            BindingOutcome::Ready => {}
            BindingOutcome::Pending { device, conditions } => {
                return Err(ControllerError::BindingPending {
                    key,
                    device: device.to_string(),
                    conditions,
                });
            }
            BindingOutcome::Failed { device, condition } => {
                return Err(ControllerError::BindingFailed {
                    key,
                    device: device.to_string(),
                    condition,
                });
            }
        }

        let mut status = base.status.clone();
        let uid = consumer.uid.clone();
        if !status.reserve(consumer)? {
            debug!(claim = %key, %uid, "consumer already reserved");
            return Ok(base);
        }
        let stored = self
            .store
            .update_claim_status(&key, base.metadata.resource_version, &status)
            .inspect_err(|e| {
                if e.is_retryable() {
                    self.metrics.record_status_conflict();
                }
            })?;
        self.metrics.record_reservation();
        info!(claim = %key, %uid, consumers = stored.status.reserved_for.len(), "claim reserved");
        Ok(stored)
    }

    /// Remove the consumer with `uid`. Returns the claim unchanged if it
    /// was not reserved by that consumer.
    pub async fn unreserve(&self, key: &str, uid: &str) -> ControllerResult<Claim> {
        let _guard = self.lock_claim(key).await;
        self.update_status(key, |status| Ok(status.unreserve(uid))).await
    }

    /// Check binding conditions of the allocated devices. A reported
    /// failure releases the allocation so the claim can be allocated again.
    pub async fn bind(&self, key: &str) -> ControllerResult<BindingOutcome> {
        let _guard = self.lock_claim(key).await;

        let claim = self.load_claim(key)?;
        let allocation = claim
            .status
            .allocation
            .as_ref()
            .ok_or(dra_core::StatusError::NotAllocated)?;
        let outcome = BindingGate::check(allocation, &claim.status.devices);
        if let BindingOutcome::Failed { device, condition } = &outcome {
            warn!(claim = %key, %device, %condition, "binding failed, releasing allocation");
            if claim.status.reserved_for.is_empty() {
                self.deallocate_locked(key).await?;
            }
        }
        Ok(outcome)
    }

    /// Record per-device status reported by a driver.
    pub async fn update_device_status(&self, key: &str, device: AllocatedDeviceStatus) -> ControllerResult<Claim> {
        let _guard = self.lock_claim(key).await;
        self.update_status(key, |status| {
            status.set_device_status(device.clone())?;
            Ok(true)
        })
        .await
    }

    /// Clear the allocation and return its devices and counters. Refused
    /// while consumers still hold reservations.
    pub async fn deallocate(&self, key: &str) -> ControllerResult<Claim> {
        let _guard = self.lock_claim(key).await;
        self.deallocate_locked(key).await
    }

    async fn deallocate_locked(&self, key: &str) -> ControllerResult<Claim> {
        let stored = self
            .update_status(key, |status| {
                if status.allocation.is_none() {
                    return Ok(false);
                }
                status.clear_allocation()?;
                Ok(true)
            })
            .await?;
        if self.ledger.release(key).is_some() {
            self.metrics.record_deallocation();
            info!(claim = %key, "claim deallocated");
        }
        Ok(stored)
    }

    /// Current eviction plan for `key`.
    pub fn eviction_plan(&self, key: &str, now: u64) -> ControllerResult<EvictionPlan> {
        let claim = self.load_claim(key)?;
        Ok(eviction::plan(&claim, &self.catalog()?, now))
    }

    /// Remove every consumer whose eviction deadline is at or before
    /// `now`. Claims whose update failed are reported, not retried.
    pub async fn sweep_evictions(&self, now: u64) -> ControllerResult<EvictionSweep> {
        let claims = self.store.list_claims()?;
        self.sweep_claims(claims, now).await
    }

    async fn sweep_claims(&self, claims: Vec<Claim>, now: u64) -> ControllerResult<EvictionSweep> {
        let catalog = self.catalog()?;
        let mut sweep = EvictionSweep::default();

        for claim in claims {
            if claim.status.reserved_for.is_empty() {
                continue;
            }
            let plan = eviction::plan(&claim, &catalog, now);
            let due: Vec<EvictionOrder> = plan.due(now).cloned().collect();
            if due.is_empty() {
                continue;
            }

            let key = claim.key();
            let _guard = self.lock_claim(&key).await;
            let result = self
                .update_status(&key, |status| {
                    let mut changed = false;
                    for order in &due {
                        changed |= status.unreserve(&order.consumer.uid);
                    }
                    Ok(changed)
                })
                .await;
            match result {
                Ok(_) => {
                    for order in &due {
                        info!(
                            claim = %key,
                            consumer = %order.consumer.name,
                            device = %order.device,
                            taint = %order.taint_key,
                            "consumer evicted"
                        );
                    }
                    self.metrics.record_evictions(due.len() as u64);
                    sweep.evicted.extend(due);
                }
                Err(e) => {
                    error!(claim = %key, error = %e, "eviction failed");
                    self.metrics.record_failure("eviction");
                    sweep.failed.push(SweepFailure { claim: key, error: e });
                }
            }
        }
        Ok(sweep)
    }

    /// Sweep evictions every `interval` until shutdown.
    pub async fn run_evictions(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "eviction sweep started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sweep_evictions(epoch_secs()).await {
                        Ok(sweep) if !sweep.failed.is_empty() => {
                            warn!(
                                evicted = sweep.evicted.len(),
                                failed = sweep.failed.len(),
                                "eviction sweep incomplete"
                            );
                        }
                        Ok(sweep) if !sweep.evicted.is_empty() => {
                            info!(count = sweep.evicted.len(), "eviction sweep done");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "eviction sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("eviction sweep shutting down");
                    break;
                }
            }
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Serialize transitions on `key`. The map entry is dropped with the
    /// last guard.
    async fn lock_claim(&self, key: &str) -> ClaimGuard<'_> {
        let lock = self
            .claim_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_default()
            .clone();
        ClaimGuard {
            locks: &self.claim_locks,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Claim keys with a lock entry, i.e. a transition in flight or queued.
    pub fn locked_claims(&self) -> usize {
        self.claim_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn load_claim(&self, key: &str) -> ControllerResult<Claim> {
        self.store
            .get_claim(key)?
            .ok_or_else(|| ControllerError::ClaimNotFound(key.to_string()))
    }

    fn catalog(&self) -> ControllerResult<PoolCatalog> {
        Ok(PoolCatalog::build(self.store.list_slices(&SliceFilter::default())?))
    }

    fn classes(&self) -> ControllerResult<HashMap<String, DeviceClass>> {
        Ok(self
            .store
            .list_classes()?
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect())
    }

    /// Read-modify-write of the claim status. `change` returns whether it
    /// modified anything; unchanged claims are not written. Stale versions
    /// are retried with a fresh read.
    async fn update_status<F>(&self, key: &str, mut change: F) -> ControllerResult<Claim>
    where
        F: FnMut(&mut dra_core::ClaimStatus) -> ControllerResult<bool>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let claim = self.load_claim(key)?;
            let mut status = claim.status.clone();
            if !change(&mut status)? {
                return Ok(claim);
            }
            match self
                .store
                .update_claim_status(key, claim.metadata.resource_version, &status)
            {
                Ok(stored) => return Ok(stored),
                Err(e @ StateError::Conflict { .. }) if attempt < attempts => {
                    self.metrics.record_status_conflict();
                    debug!(claim = %key, attempt, error = %e, "stale claim, retrying");
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.config.retry_backoff_ms.saturating_mul(u64::from(attempt));
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

type ClaimLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

struct ClaimGuard<'a> {
    locks: &'a ClaimLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        // Release first so the map holds the only reference when idle.
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
