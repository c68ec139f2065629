//! Allocation search.
//!
//! Requests are satisfied in order by depth-first search with backtracking.
//! The first complete assignment wins; no attempt is made to find a better
//! one. For each request:
//!
//! 1. resolve the class (its selectors are ANDed with the request's),
//! 2. filter devices of complete pools by node, taints and selectors,
//! 3. tentatively take devices, checking device availability, counter
//!    headroom and `matchAttribute` constraints incrementally,
//! 4. on a dead end, undo the tentative takes and try the next device or
//!    the next `firstAvailable` alternative.
//!
//! The result snapshots each device's tolerations and binding conditions.

use std::collections::{HashMap, HashSet};

use dra_core::{
    AllocationConfigSource, AllocationMode, AllocationResult, Claim, DeviceAllocationConfiguration,
    DeviceAttribute, DeviceClass, DeviceConstraint, DeviceId, DeviceRequestAllocationResult,
    DeviceSelector, DeviceToleration, ExactDeviceRequest, NodeInfo, NodeSelector, Quantity,
    RequestKind,
};
use tracing::{debug, info, warn};

use crate::error::{AllocResult, AllocationError};
use crate::ledger::{CommitPlan, CounterCharge, CounterKey, LedgerSnapshot};
use crate::pool::{CatalogDevice, PoolCatalog};
use crate::selector::{DeviceView, SelectorEvaluator};

/// Where and when an allocation is made.
#[derive(Debug, Clone, Default)]
pub struct AllocationTarget {
    /// Node the consumer will run on. `None` allocates without node
    /// filtering.
    pub node: Option<NodeInfo>,
    /// Unix timestamp (seconds) recorded in the result.
    pub now: u64,
}

/// A successful decision: the result to store and what it takes from the
/// shared ledger.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub result: AllocationResult,
    pub plan: CommitPlan,
}

pub struct Allocator<E> {
    evaluator: E,
}

/// One way of satisfying a request.
struct Alternative<'a> {
    /// `main` or `main/sub`.
    name: String,
    request: &'a ExactDeviceRequest,
    class: &'a DeviceClass,
}

struct Candidate<'c> {
    id: DeviceId,
    dev: CatalogDevice<'c>,
    charges: Vec<CounterCharge>,
}

/// Tentative state of one search.
struct Workspace<'a> {
    base: &'a LedgerSnapshot,
    taken: HashSet<DeviceId>,
    consumed: HashMap<CounterKey, Quantity>,
    /// Established value per constraint index.
    constraint_values: Vec<Option<DeviceAttribute>>,
}

/// Undo record for one tentative take.
struct Taken {
    constraint_prev: Vec<(usize, Option<DeviceAttribute>)>,
}

impl<E: SelectorEvaluator> Allocator<E> {
    pub fn new(evaluator: E) -> Self {
        Self { evaluator }
    }

    /// Decide an allocation for `claim`. Classes are looked up by name at
    /// this moment; later class edits do not affect the result.
    pub fn allocate(
        &self,
        claim: &Claim,
        classes: &HashMap<String, DeviceClass>,
        catalog: &PoolCatalog,
        ledger: &LedgerSnapshot,
        target: &AllocationTarget,
    ) -> AllocResult<Allocation> {
        let key = claim.key();
        if claim.status.allocation.is_some() {
            return Err(AllocationError::InvalidClaim(format!("{key} is already allocated")));
        }
        let devices = &claim.spec.devices;

        let mut slots: Vec<Vec<Alternative<'_>>> = Vec::with_capacity(devices.requests.len());
        for req in &devices.requests {
            let pairs: Vec<(String, &ExactDeviceRequest)> = match &req.kind {
                RequestKind::Exactly(e) => vec![(req.name.clone(), e)],
                RequestKind::FirstAvailable(subs) => subs
                    .iter()
                    .map(|s| (format!("{}/{}", req.name, s.name), &s.request))
                    .collect(),
            };
            let mut alternatives = Vec::with_capacity(pairs.len());
            for (name, request) in pairs {
                let class = classes.get(&request.device_class_name).ok_or_else(|| {
                    AllocationError::ClassNotFound {
                        class: request.device_class_name.clone(),
                    }
                })?;
                alternatives.push(Alternative {
                    name,
                    request,
                    class,
                });
            }
            slots.push(alternatives);
        }

        let mut search = Search {
            allocator: self,
            catalog,
            target,
            constraints: &devices.constraints,
            slots: &slots,
            candidates: HashMap::new(),
            chosen: Vec::new(),
            deepest_failure: 0,
            ws: Workspace {
                base: ledger,
                taken: HashSet::new(),
                consumed: HashMap::new(),
                constraint_values: vec![None; devices.constraints.len()],
            },
        };

        if !search.solve(0)? {
            let request = devices
                .requests
                .get(search.deepest_failure)
                .map(|r| r.name.clone())
                .unwrap_or_default();
            let incomplete = catalog.incomplete_pools();
            if !incomplete.is_empty() {
                let pools: Vec<String> = incomplete.iter().map(|p| p.to_string()).collect();
                debug!(claim = %key, ?pools, "allocation deferred on incomplete pools");
                return Err(AllocationError::Incomplete { pools });
            }
            warn!(claim = %key, %request, "insufficient resources");
            return Err(AllocationError::Insufficient { request });
        }

        let allocation = search.finish(&key, claim);
        info!(
            claim = %key,
            devices = allocation.result.results.len(),
            "allocation decided"
        );
        Ok(allocation)
    }
}

struct Search<'s, 'c, E> {
    allocator: &'s Allocator<E>,
    catalog: &'c PoolCatalog,
    target: &'s AllocationTarget,
    constraints: &'s [DeviceConstraint],
    slots: &'s [Vec<Alternative<'s>>],
    /// Filtered candidates per (request, alternative), computed on first use.
    candidates: HashMap<(usize, usize), Vec<Candidate<'c>>>,
    /// (request index, alternative index, candidate index, admin access)
    chosen: Vec<(usize, usize, usize, bool)>,
    deepest_failure: usize,
    ws: Workspace<'s>,
}

impl<'s, 'c, E: SelectorEvaluator> Search<'s, 'c, E> {
    fn solve(&mut self, slot: usize) -> AllocResult<bool> {
        if slot == self.slots.len() {
            return Ok(true);
        }
        self.deepest_failure = self.deepest_failure.max(slot);
        for alt in 0..self.slots[slot].len() {
            self.ensure_candidates(slot, alt)?;
            let request = self.slots[slot][alt].request;
            let admin = request.admin_access();
            let len = self.candidates[&(slot, alt)].len();

            let found = match request.allocation_mode {
                AllocationMode::ExactCount => {
                    let count = usize::try_from(request.count()).unwrap_or(0);
                    self.pick(slot, alt, admin, 0, count)?
                }
                AllocationMode::All => self.take_all(slot, alt, admin, len)?,
            };
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Choose `remaining` more devices from candidates `from..` of one
    /// alternative, then continue with the next request.
    fn pick(&mut self, slot: usize, alt: usize, admin: bool, from: usize, remaining: usize) -> AllocResult<bool> {
        if remaining == 0 {
            return self.solve(slot + 1);
        }
        let len = self.candidates[&(slot, alt)].len();
        for idx in from..len {
            if len - idx < remaining {
                break;
            }
            let Some(undo) = self.try_take(slot, alt, idx, admin) else {
                continue;
            };
            if self.pick(slot, alt, admin, idx + 1, remaining - 1)? {
                return Ok(true);
            }
            self.untake(slot, alt, idx, admin, undo);
        }
        Ok(false)
    }

    /// `All` mode: every candidate, or nothing.
    fn take_all(&mut self, slot: usize, alt: usize, admin: bool, len: usize) -> AllocResult<bool> {
        if len == 0 {
            return Ok(false);
        }
        let mut undos = Vec::with_capacity(len);
        for idx in 0..len {
            match self.try_take(slot, alt, idx, admin) {
                Some(undo) => undos.push((idx, undo)),
                None => {
                    while let Some((i, undo)) = undos.pop() {
                        self.untake(slot, alt, i, admin, undo);
                    }
                    return Ok(false);
                }
            }
        }
        if self.solve(slot + 1)? {
            return Ok(true);
        }
        while let Some((i, undo)) = undos.pop() {
            self.untake(slot, alt, i, admin, undo);
        }
        Ok(false)
    }

    fn try_take(&mut self, slot: usize, alt: usize, idx: usize, admin: bool) -> Option<Taken> {
        let name = &self.slots[slot][alt].name;
        let cand = &self.candidates[&(slot, alt)][idx];

        if self.ws.taken.contains(&cand.id) {
            return None;
        }
        if !admin {
            if self.ws.base.devices_in_use.contains(&cand.id) {
                return None;
            }
            for charge in &cand.charges {
                let pending = self.ws.consumed.get(&charge.key).cloned().unwrap_or_default();
                let total = self
                    .ws
                    .base
                    .consumed(&charge.key)
                    .checked_add(&pending)
                    .and_then(|t| t.checked_add(&charge.amount));
                if !total.is_some_and(|t| t <= charge.limit) {
                    return None;
                }
            }
        }

        // Check every applicable constraint before establishing any.
        let mut establish = Vec::new();
        for (ci, constraint) in self.constraints.iter().enumerate() {
            let Some(attr_name) = &constraint.match_attribute else {
                continue;
            };
            if !constraint.applies_to(name) {
                continue;
            }
            let value = cand.dev.device.attribute(&cand.id.driver, attr_name)?;
            match &self.ws.constraint_values[ci] {
                Some(established) if !established.same_value(value) => return None,
                Some(_) => {}
                None => establish.push((ci, value.clone())),
            }
        }
        let mut constraint_prev = Vec::with_capacity(establish.len());
        for (ci, value) in establish {
            constraint_prev.push((ci, self.ws.constraint_values[ci].replace(value)));
        }

        self.ws.taken.insert(cand.id.clone());
        if !admin {
            for charge in &cand.charges {
                let used = self.ws.consumed.entry(charge.key.clone()).or_default();
                *used = used.checked_add(&charge.amount).unwrap_or_else(|| used.clone());
            }
        }
        self.chosen.push((slot, alt, idx, admin));
        Some(Taken { constraint_prev })
    }

    fn untake(&mut self, slot: usize, alt: usize, idx: usize, admin: bool, undo: Taken) {
        let cand = &self.candidates[&(slot, alt)][idx];
        self.ws.taken.remove(&cand.id);
        if !admin {
            for charge in &cand.charges {
                if let Some(c) = self.ws.consumed.get_mut(&charge.key) {
                    *c = c.saturating_sub(&charge.amount);
                }
            }
        }
        for (i, prev) in undo.constraint_prev.into_iter().rev() {
            self.ws.constraint_values[i] = prev;
        }
        self.chosen.pop();
    }

    fn ensure_candidates(&mut self, slot: usize, alt: usize) -> AllocResult<()> {
        if self.candidates.contains_key(&(slot, alt)) {
            return Ok(());
        }
        let alternative = &self.slots[slot][alt];
        let selectors: Vec<&DeviceSelector> = alternative
            .class
            .spec
            .selectors
            .iter()
            .chain(&alternative.request.selectors)
            .collect();

        let mut out = Vec::new();
        for dev in self.catalog.allocatable_devices() {
            if let Some(node) = &self.target.node
                && !dev.slice.device_available_on(dev.device, node)
            {
                continue;
            }
            if !tolerates_all(&alternative.request.tolerations, dev) {
                continue;
            }
            let view = DeviceView::new(&dev.slice.spec.driver, dev.device);
            let mut selected = true;
            for selector in &selectors {
                let expression = selector.expression();
                let matched = self
                    .allocator
                    .evaluator
                    .matches(expression, &view)
                    .map_err(|source| AllocationError::Selector {
                        request: alternative.name.clone(),
                        expression: expression.to_string(),
                        source,
                    })?;
                if !matched {
                    selected = false;
                    break;
                }
            }
            if !selected {
                continue;
            }
            let Some(charges) = counter_charges(self.catalog, dev) else {
                continue;
            };
            out.push(Candidate {
                id: dev.id(),
                dev,
                charges,
            });
        }
        debug!(
            request = %alternative.name,
            class = %alternative.class.name(),
            candidates = out.len(),
            "candidates filtered"
        );
        self.candidates.insert((slot, alt), out);
        Ok(())
    }

    fn finish(self, key: &str, claim: &Claim) -> Allocation {
        let mut results = Vec::with_capacity(self.chosen.len());
        let mut node_selector: Option<NodeSelector> = None;
        let mut config = Vec::new();
        let mut configured_requests = HashSet::new();
        let mut plan = CommitPlan {
            owner: key.to_string(),
            ..CommitPlan::default()
        };
        let mut charges: HashMap<CounterKey, CounterCharge> = HashMap::new();

        for &(slot, alt, idx, admin) in &self.chosen {
            let alternative = &self.slots[slot][alt];
            let cand = &self.candidates[&(slot, alt)][idx];
            let device = cand.dev.device;

            results.push(DeviceRequestAllocationResult {
                request: alternative.name.clone(),
                driver: cand.id.driver.clone(),
                pool: cand.id.pool.clone(),
                device: cand.id.device.clone(),
                admin_access: admin.then_some(true),
                tolerations: alternative.request.tolerations.clone(),
                binding_conditions: device.binding_conditions.clone(),
                binding_failure_conditions: device.binding_failure_conditions.clone(),
            });

            let mut device_selector = cand.dev.slice.device_node_selector(device);
            if device.binds_to_node()
                && let Some(node) = &self.target.node
            {
                let pinned = NodeSelector::for_node(&node.name);
                device_selector = Some(match device_selector {
                    Some(s) => s.intersect(&pinned),
                    None => pinned,
                });
            }
            node_selector = match (node_selector, device_selector) {
                (Some(a), Some(b)) => Some(if a == b { a } else { a.intersect(&b) }),
                (a, b) => a.or(b),
            };

            if configured_requests.insert(alternative.name.clone()) {
                for c in &alternative.class.spec.config {
                    config.push(DeviceAllocationConfiguration {
                        source: AllocationConfigSource::FromClass,
                        requests: vec![alternative.name.clone()],
                        config: c.config.clone(),
                    });
                }
            }

            if !admin {
                plan.devices.push(cand.id.clone());
                for charge in &cand.charges {
                    charges
                        .entry(charge.key.clone())
                        .and_modify(|c| {
                            c.amount = c.amount.checked_add(&charge.amount).unwrap_or_else(|| c.amount.clone())
                        })
                        .or_insert_with(|| charge.clone());
                }
            }
        }

        for c in &claim.spec.devices.config {
            config.push(DeviceAllocationConfiguration {
                source: AllocationConfigSource::FromClaim,
                requests: c.requests.clone(),
                config: c.config.clone(),
            });
        }

        let mut charges: Vec<CounterCharge> = charges.into_values().collect();
        charges.sort_by(|a, b| a.key.cmp(&b.key));
        plan.charges = charges;

        Allocation {
            result: AllocationResult {
                results,
                config,
                node_selector,
                allocation_timestamp: Some(self.target.now),
            },
            plan,
        }
    }
}

/// New allocations must tolerate every taint on the device.
fn tolerates_all(tolerations: &[DeviceToleration], dev: CatalogDevice<'_>) -> bool {
    dev.device
        .taints
        .iter()
        .all(|taint| tolerations.iter().any(|t| t.tolerates(taint)))
}

/// Counter consumption of one device. `None` if it references a counter
/// its pool does not declare.
fn counter_charges(catalog: &PoolCatalog, dev: CatalogDevice<'_>) -> Option<Vec<CounterCharge>> {
    let pool_id = dev.slice.pool_id();
    let pool = catalog.pool(&pool_id.driver, &pool_id.pool)?;
    let mut charges = Vec::new();
    for consumption in &dev.device.consumes_counters {
        for (counter, c) in &consumption.counters {
            let limit = pool.counter_limit(&consumption.counter_set, counter)?;
            charges.push(CounterCharge {
                key: CounterKey {
                    pool: pool_id.clone(),
                    set: consumption.counter_set.clone(),
                    counter: counter.clone(),
                },
                amount: c.value.clone(),
                limit: limit.clone(),
            });
        }
    }
    Some(charges)
}
