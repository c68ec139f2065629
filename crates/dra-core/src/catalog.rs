//! Supply side: slices, pools, devices, attributes, capacities, counters
//! and taints.
//!
//! Slices are published by drivers and replaced as a whole. A pool may be
//! split across several slices that share a pool name, a generation and a
//! slice count.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OneOfError, ValidationErrors, ValidationResult};
use crate::meta::ObjectMeta;
use crate::names;
use crate::node_selector::{NodeInfo, NodeSelector};
use crate::quantity::Quantity;

pub const SLICE_MAX_DEVICES: usize = 128;
/// Summed across all counter sets of a slice.
pub const SLICE_MAX_SHARED_COUNTERS: usize = 32;
/// Device/counter consumption pairs across all devices of a slice.
pub const SLICE_MAX_DEVICE_COUNTERS: usize = 1024;
pub const DEVICE_MAX_ATTRIBUTES_AND_CAPACITIES: usize = 32;
pub const DEVICE_MAX_COUNTERS: usize = 32;
pub const DEVICE_MAX_TAINTS: usize = 4;
pub const BINDING_CONDITIONS_MAX: usize = 4;
pub const BINDING_FAILURE_CONDITIONS_MAX: usize = 4;
/// Maximum length of a string or version attribute value.
pub const ATTRIBUTE_MAX_VALUE_LENGTH: usize = 64;

/// Field selector key for listing slices by node.
pub const SLICE_SELECTOR_NODE_NAME: &str = "spec.nodeName";
/// Field selector key for listing slices by driver.
pub const SLICE_SELECTOR_DRIVER: &str = "spec.driver";

// ── Identity ──────────────────────────────────────────────────────

/// A pool is identified by its driver and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId {
    pub driver: String,
    pub pool: String,
}

impl PoolId {
    pub fn new(driver: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            pool: pool.into(),
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.driver, self.pool)
    }
}

/// The driver/pool/device triple that identifies one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub driver: String,
    pub pool: String,
    pub device: String,
}

impl DeviceId {
    pub fn new(driver: impl Into<String>, pool: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            pool: pool.into(),
            device: device.into(),
        }
    }

    pub fn pool_id(&self) -> PoolId {
        PoolId::new(self.driver.clone(), self.pool.clone())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.driver, self.pool, self.device)
    }
}

// ── Slice ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    pub metadata: ObjectMeta,
    pub spec: SliceSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceSpec {
    pub driver: String,
    pub pool: Pool,
    #[serde(flatten)]
    pub node_scope: NodeScope,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_counters: Vec<CounterSet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub name: String,
    pub generation: i64,
    pub resource_slice_count: i64,
}

/// Where the devices of a slice are reachable from. Exactly one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NodeScopeFields", into = "NodeScopeFields")]
pub enum NodeScope {
    NodeName(String),
    NodeSelector(NodeSelector),
    AllNodes,
    /// Every device declares its own node scope.
    PerDevice,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeScopeFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node_selector: Option<NodeSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    all_nodes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    per_device_node_selection: Option<bool>,
}

impl TryFrom<NodeScopeFields> for NodeScope {
    type Error = OneOfError;

    fn try_from(f: NodeScopeFields) -> Result<Self, Self::Error> {
        let all_nodes = f.all_nodes.unwrap_or(false);
        let per_device = f.per_device_node_selection.unwrap_or(false);
        let found = usize::from(f.node_name.is_some())
            + usize::from(f.node_selector.is_some())
            + usize::from(all_nodes)
            + usize::from(per_device);
        if found != 1 {
            return Err(OneOfError {
                members: "nodeName, nodeSelector, allNodes, perDeviceNodeSelection",
                found,
            });
        }
        Ok(match (f.node_name, f.node_selector) {
            (Some(name), _) => NodeScope::NodeName(name),
            (_, Some(sel)) => NodeScope::NodeSelector(sel),
            _ if all_nodes => NodeScope::AllNodes,
            _ => NodeScope::PerDevice,
        })
    }
}

impl From<NodeScope> for NodeScopeFields {
    fn from(scope: NodeScope) -> Self {
        let mut f = NodeScopeFields::default();
        match scope {
            NodeScope::NodeName(n) => f.node_name = Some(n),
            NodeScope::NodeSelector(s) => f.node_selector = Some(s),
            NodeScope::AllNodes => f.all_nodes = Some(true),
            NodeScope::PerDevice => f.per_device_node_selection = Some(true),
        }
        f
    }
}

/// A named set of counters that devices of the same slice consume from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSet {
    pub name: String,
    #[serde(default)]
    pub counters: BTreeMap<String, Counter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub value: Quantity,
}

impl Counter {
    pub fn new(value: Quantity) -> Self {
        Self { value }
    }
}

// ── Device ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, DeviceAttribute>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, DeviceCapacity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumes_counters: Vec<DeviceCounterConsumption>,
    #[serde(flatten)]
    pub node_scope: DeviceNodeScope,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<DeviceTaint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binds_to_node: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binding_conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binding_failure_conditions: Vec<String>,
}

/// Per-device node scope. Only used when the slice selects
/// [`NodeScope::PerDevice`]; at most one mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DeviceNodeScopeFields", into = "DeviceNodeScopeFields")]
pub enum DeviceNodeScope {
    #[default]
    FromSlice,
    NodeName(String),
    NodeSelector(NodeSelector),
    AllNodes,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceNodeScopeFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node_selector: Option<NodeSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    all_nodes: Option<bool>,
}

impl TryFrom<DeviceNodeScopeFields> for DeviceNodeScope {
    type Error = OneOfError;

    fn try_from(f: DeviceNodeScopeFields) -> Result<Self, Self::Error> {
        let all_nodes = f.all_nodes.unwrap_or(false);
        let found = usize::from(f.node_name.is_some())
            + usize::from(f.node_selector.is_some())
            + usize::from(all_nodes);
        if found > 1 {
            return Err(OneOfError {
                members: "nodeName, nodeSelector, allNodes",
                found,
            });
        }
        Ok(match (f.node_name, f.node_selector) {
            (Some(name), _) => DeviceNodeScope::NodeName(name),
            (_, Some(sel)) => DeviceNodeScope::NodeSelector(sel),
            _ if all_nodes => DeviceNodeScope::AllNodes,
            _ => DeviceNodeScope::FromSlice,
        })
    }
}

impl From<DeviceNodeScope> for DeviceNodeScopeFields {
    fn from(scope: DeviceNodeScope) -> Self {
        let mut f = DeviceNodeScopeFields::default();
        match scope {
            DeviceNodeScope::FromSlice => {}
            DeviceNodeScope::NodeName(n) => f.node_name = Some(n),
            DeviceNodeScope::NodeSelector(s) => f.node_selector = Some(s),
            DeviceNodeScope::AllNodes => f.all_nodes = Some(true),
        }
        f
    }
}

/// A typed attribute value. Serialized as `{"int": 4}`, `{"bool": true}`,
/// `{"string": "a100"}` or `{"version": "1.2.0"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAttribute {
    Int(i64),
    Bool(bool),
    String(String),
    Version(String),
}

impl DeviceAttribute {
    pub fn type_name(&self) -> &'static str {
        match self {
            DeviceAttribute::Int(_) => "int",
            DeviceAttribute::Bool(_) => "bool",
            DeviceAttribute::String(_) => "string",
            DeviceAttribute::Version(_) => "version",
        }
    }

    /// Equal type and equal value. Versions compare by semantic version so
    /// build metadata does not make two otherwise equal values differ.
    pub fn same_value(&self, other: &DeviceAttribute) -> bool {
        match (self, other) {
            (DeviceAttribute::Version(a), DeviceAttribute::Version(b)) => {
                match (semver::Version::parse(a), semver::Version::parse(b)) {
                    (Ok(a), Ok(b)) => a.cmp_precedence(&b).is_eq(),
                    _ => a == b,
                }
            }
            _ => self == other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapacity {
    pub value: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCounterConsumption {
    pub counter_set: String,
    #[serde(default)]
    pub counters: BTreeMap<String, Counter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTaint {
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    pub effect: TaintEffect,
    /// Unix timestamp (seconds). Defaulted by the store when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_added: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    /// New allocations must tolerate the taint.
    NoSchedule,
    /// Existing consumers are evicted unless they tolerate the taint.
    NoExecute,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
            capacity: BTreeMap::new(),
            consumes_counters: Vec::new(),
            node_scope: DeviceNodeScope::FromSlice,
            taints: Vec::new(),
            binds_to_node: None,
            binding_conditions: Vec::new(),
            binding_failure_conditions: Vec::new(),
        }
    }

    /// Look up an attribute by fully-qualified name. Unqualified attribute
    /// names on the device belong to the driver's domain.
    pub fn attribute(&self, driver: &str, fully_qualified: &str) -> Option<&DeviceAttribute> {
        if let Some(v) = self.attributes.get(fully_qualified) {
            return Some(v);
        }
        match names::split_qualified(fully_qualified) {
            (Some(domain), id) if domain == driver => self.attributes.get(id),
            _ => None,
        }
    }

    pub fn binds_to_node(&self) -> bool {
        self.binds_to_node.unwrap_or(false)
    }

    pub fn counter_pairs(&self) -> usize {
        self.consumes_counters.iter().map(|c| c.counters.len()).sum()
    }

    fn validate(
        &self,
        errs: &mut ValidationErrors,
        field: &str,
        slice_scope: &NodeScope,
        counter_sets: &BTreeMap<&str, &CounterSet>,
    ) {
        names::validate_dns_label(errs, &format!("{field}.name"), &self.name);

        let entries = self.attributes.len() + self.capacity.len();
        if entries > DEVICE_MAX_ATTRIBUTES_AND_CAPACITIES {
            errs.too_many(
                format!("{field}.attributes"),
                DEVICE_MAX_ATTRIBUTES_AND_CAPACITIES,
                entries,
            );
        }
        for (name, attr) in &self.attributes {
            let af = format!("{field}.attributes[{name}]");
            names::validate_qualified_name(errs, &af, name);
            match attr {
                DeviceAttribute::String(s) if s.len() > ATTRIBUTE_MAX_VALUE_LENGTH => {
                    errs.too_long(af, ATTRIBUTE_MAX_VALUE_LENGTH, s.len())
                }
                DeviceAttribute::Version(v) => {
                    if v.len() > ATTRIBUTE_MAX_VALUE_LENGTH {
                        errs.too_long(af.clone(), ATTRIBUTE_MAX_VALUE_LENGTH, v.len());
                    }
                    if semver::Version::parse(v).is_err() {
                        errs.invalid(af, v, "must be a semantic version");
                    }
                }
                _ => {}
            }
        }
        for (name, cap) in &self.capacity {
            let cf = format!("{field}.capacity[{name}]");
            names::validate_qualified_name(errs, &cf, name);
            if cap.value.is_negative() {
                errs.invalid(cf, cap.value.to_string(), "must not be negative");
            }
        }

        let mut seen_sets = HashSet::new();
        for (i, consumption) in self.consumes_counters.iter().enumerate() {
            let cf = format!("{field}.consumesCounters[{i}]");
            if !seen_sets.insert(consumption.counter_set.as_str()) {
                errs.duplicate(format!("{cf}.counterSet"), &consumption.counter_set);
            }
            let Some(set) = counter_sets.get(consumption.counter_set.as_str()) else {
                errs.invalid(
                    format!("{cf}.counterSet"),
                    &consumption.counter_set,
                    "must reference a counter set of this slice",
                );
                continue;
            };
            for (name, counter) in &consumption.counters {
                if !set.counters.contains_key(name) {
                    errs.invalid(
                        format!("{cf}.counters"),
                        name,
                        "must reference a counter of the counter set",
                    );
                }
                if counter.value.is_negative() {
                    errs.invalid(
                        format!("{cf}.counters[{name}]"),
                        counter.value.to_string(),
                        "must not be negative",
                    );
                }
            }
        }
        errs.max_items(
            format!("{field}.consumesCounters"),
            DEVICE_MAX_COUNTERS,
            self.counter_pairs(),
        );

        match (slice_scope, &self.node_scope) {
            (NodeScope::PerDevice, DeviceNodeScope::FromSlice) => errs.required(format!(
                "{field}.nodeName, {field}.nodeSelector or {field}.allNodes"
            )),
            (NodeScope::PerDevice, DeviceNodeScope::NodeName(n)) => {
                names::validate_dns_subdomain(errs, &format!("{field}.nodeName"), n)
            }
            (NodeScope::PerDevice, DeviceNodeScope::NodeSelector(s)) => {
                s.validate_single_term(errs, &format!("{field}.nodeSelector"))
            }
            (NodeScope::PerDevice, DeviceNodeScope::AllNodes) => {}
            (_, DeviceNodeScope::FromSlice) => {}
            (_, _) => errs.forbidden(
                format!("{field}.nodeName"),
                "only allowed when perDeviceNodeSelection is set",
            ),
        }

        errs.max_items(format!("{field}.taints"), DEVICE_MAX_TAINTS, self.taints.len());
        for (i, taint) in self.taints.iter().enumerate() {
            let tf = format!("{field}.taints[{i}]");
            names::validate_label_name(errs, &format!("{tf}.key"), &taint.key);
            names::validate_label_value(errs, &format!("{tf}.value"), &taint.value);
        }

        validate_conditions(
            errs,
            &format!("{field}.bindingConditions"),
            &self.binding_conditions,
            BINDING_CONDITIONS_MAX,
        );
        validate_conditions(
            errs,
            &format!("{field}.bindingFailureConditions"),
            &self.binding_failure_conditions,
            BINDING_FAILURE_CONDITIONS_MAX,
        );
        if !self.binding_conditions.is_empty() && self.binding_failure_conditions.is_empty() {
            errs.required(format!("{field}.bindingFailureConditions"));
        }
    }
}

fn validate_conditions(errs: &mut ValidationErrors, field: &str, conditions: &[String], max: usize) {
    errs.max_items(field, max, conditions.len());
    let mut seen = HashSet::new();
    for c in conditions {
        names::validate_label_name(errs, field, c);
        if !seen.insert(c.as_str()) {
            errs.duplicate(field, c);
        }
    }
}

impl Slice {
    pub fn pool_id(&self) -> PoolId {
        PoolId::new(self.spec.driver.clone(), self.spec.pool.name.clone())
    }

    pub fn device_id(&self, device: &Device) -> DeviceId {
        DeviceId::new(
            self.spec.driver.clone(),
            self.spec.pool.name.clone(),
            device.name.clone(),
        )
    }

    pub fn counter_set(&self, name: &str) -> Option<&CounterSet> {
        self.spec.shared_counters.iter().find(|s| s.name == name)
    }

    /// The node name this slice is pinned to, if any.
    pub fn node_name(&self) -> Option<&str> {
        match &self.spec.node_scope {
            NodeScope::NodeName(n) => Some(n),
            _ => None,
        }
    }

    /// Node selector restricting where `device` is usable. `None` means
    /// every node.
    pub fn device_node_selector(&self, device: &Device) -> Option<NodeSelector> {
        let by_name = |n: &str| Some(NodeSelector::for_node(n));
        match (&self.spec.node_scope, &device.node_scope) {
            (NodeScope::PerDevice, DeviceNodeScope::NodeName(n)) => by_name(n),
            (NodeScope::PerDevice, DeviceNodeScope::NodeSelector(s)) => Some(s.clone()),
            (NodeScope::PerDevice, _) => None,
            (NodeScope::NodeName(n), _) => by_name(n),
            (NodeScope::NodeSelector(s), _) => Some(s.clone()),
            (NodeScope::AllNodes, _) => None,
        }
    }

    /// Whether `device` can be used from `node`.
    pub fn device_available_on(&self, device: &Device, node: &NodeInfo) -> bool {
        match (&self.spec.node_scope, &device.node_scope) {
            (NodeScope::NodeName(n), _) | (NodeScope::PerDevice, DeviceNodeScope::NodeName(n)) => {
                *n == node.name
            }
            _ => self
                .device_node_selector(device)
                .is_none_or(|s| s.matches(node)),
        }
    }

    /// Stamp taints that lack a `time_added` with `now`.
    pub fn default_taint_times(&mut self, now: u64) {
        for device in &mut self.spec.devices {
            for taint in &mut device.taints {
                taint.time_added.get_or_insert(now);
            }
        }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut errs = ValidationErrors::default();
        self.metadata.validate(&mut errs, false);
        let spec = &self.spec;

        names::validate_driver_name(&mut errs, "spec.driver", &spec.driver);
        names::validate_pool_name(&mut errs, "spec.pool.name", &spec.pool.name);
        if spec.pool.generation < 0 {
            errs.invalid(
                "spec.pool.generation",
                spec.pool.generation.to_string(),
                "must not be negative",
            );
        }
        if spec.pool.resource_slice_count <= 0 {
            errs.invalid(
                "spec.pool.resourceSliceCount",
                spec.pool.resource_slice_count.to_string(),
                "must be greater than zero",
            );
        }

        match &spec.node_scope {
            NodeScope::NodeName(n) => names::validate_dns_subdomain(&mut errs, "spec.nodeName", n),
            NodeScope::NodeSelector(s) => s.validate_single_term(&mut errs, "spec.nodeSelector"),
            NodeScope::AllNodes | NodeScope::PerDevice => {}
        }

        let mut set_names = BTreeMap::new();
        let mut total_counters = 0;
        for (i, set) in spec.shared_counters.iter().enumerate() {
            let sf = format!("spec.sharedCounters[{i}]");
            names::validate_dns_label(&mut errs, &format!("{sf}.name"), &set.name);
            if set_names.insert(set.name.as_str(), set).is_some() {
                errs.duplicate(format!("{sf}.name"), &set.name);
            }
            if set.counters.is_empty() {
                errs.required(format!("{sf}.counters"));
            }
            for (name, counter) in &set.counters {
                names::validate_dns_label(&mut errs, &format!("{sf}.counters"), name);
                if counter.value.is_negative() {
                    errs.invalid(
                        format!("{sf}.counters[{name}]"),
                        counter.value.to_string(),
                        "must not be negative",
                    );
                }
            }
            total_counters += set.counters.len();
        }
        errs.max_items("spec.sharedCounters", SLICE_MAX_SHARED_COUNTERS, total_counters);

        errs.max_items("spec.devices", SLICE_MAX_DEVICES, spec.devices.len());
        let mut device_names = HashSet::new();
        let mut device_counters = 0;
        for (i, device) in spec.devices.iter().enumerate() {
            let df = format!("spec.devices[{i}]");
            if !device_names.insert(device.name.as_str()) {
                errs.duplicate(format!("{df}.name"), &device.name);
            }
            device.validate(&mut errs, &df, &spec.node_scope, &set_names);
            device_counters += device.counter_pairs();
        }
        errs.max_items(
            "spec.devices[*].consumesCounters",
            SLICE_MAX_DEVICE_COUNTERS,
            device_counters,
        );

        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    pub(crate) fn gpu_slice() -> Slice {
        let mut device = Device::new("gpu-0");
        device
            .attributes
            .insert("model".to_string(), DeviceAttribute::String("a100".to_string()));
        device.capacity.insert(
            "memory".to_string(),
            DeviceCapacity {
                value: "40Gi".parse().unwrap(),
            },
        );
        Slice {
            metadata: ObjectMeta::named("node-1-gpu"),
            spec: SliceSpec {
                driver: "gpu.example.com".to_string(),
                pool: Pool {
                    name: "node-1".to_string(),
                    generation: 1,
                    resource_slice_count: 1,
                },
                node_scope: NodeScope::NodeName("node-1".to_string()),
                devices: vec![device],
                shared_counters: Vec::new(),
            },
        }
    }

    #[test]
    fn valid_slice_passes() {
        assert_eq!(gpu_slice().validate(), Ok(()));
    }

    #[test]
    fn node_scope_requires_exactly_one_member() {
        let none = r#"{"metadata":{"name":"s"},"spec":{"driver":"d.example.com","pool":{"name":"p","generation":1,"resourceSliceCount":1},"devices":[]}}"#;
        let err = serde_json::from_str::<Slice>(none).unwrap_err();
        assert!(err.to_string().contains("exactly one of"));

        let two = r#"{"metadata":{"name":"s"},"spec":{"driver":"d.example.com","pool":{"name":"p","generation":1,"resourceSliceCount":1},"nodeName":"n","allNodes":true,"devices":[]}}"#;
        assert!(serde_json::from_str::<Slice>(two).is_err());

        let one = r#"{"metadata":{"name":"s"},"spec":{"driver":"d.example.com","pool":{"name":"p","generation":1,"resourceSliceCount":1},"allNodes":true,"devices":[]}}"#;
        let slice: Slice = serde_json::from_str(one).unwrap();
        assert_eq!(slice.spec.node_scope, NodeScope::AllNodes);
    }

    #[test]
    fn serde_preserves_node_scope_and_attributes() {
        let slice = gpu_slice();
        let json = serde_json::to_value(&slice).unwrap();
        assert_eq!(json["spec"]["nodeName"], "node-1");
        assert_eq!(json["spec"]["devices"][0]["attributes"]["model"]["string"], "a100");
        let back: Slice = serde_json::from_value(json).unwrap();
        assert_eq!(back, slice);
    }

    fn round_trip(doc: serde_json::Value) -> Slice {
        let slice: Slice = serde_json::from_value(doc).unwrap();
        let back: Slice = serde_json::from_value(serde_json::to_value(&slice).unwrap()).unwrap();
        assert_eq!(back, slice);
        back
    }

    #[test]
    fn node_selector_slice_round_trips() {
        let slice = round_trip(serde_json::json!({
            "metadata": {"name": "rack-a"},
            "spec": {
                "driver": "nic.example.com",
                "pool": {"name": "rack-a", "generation": 3, "resourceSliceCount": 1},
                "nodeSelector": {"nodeSelectorTerms": [{
                    "matchExpressions": [{"key": "rack", "operator": "In", "values": ["a"]}],
                    "matchFields": [{"key": "metadata.name", "operator": "NotIn", "values": ["node-9"]}]
                }]},
                "devices": [{
                    "name": "nic-0",
                    "capacity": {"bandwidth": {"value": "100G"}},
                    "taints": [{"key": "degraded", "value": "true", "effect": "NoSchedule", "timeAdded": 1700000000}]
                }]
            }
        }));
        assert!(matches!(slice.spec.node_scope, NodeScope::NodeSelector(_)));
    }

    #[test]
    fn per_device_node_selection_round_trips() {
        let slice = round_trip(serde_json::json!({
            "metadata": {"name": "shared"},
            "spec": {
                "driver": "gpu.example.com",
                "pool": {"name": "shared", "generation": 1, "resourceSliceCount": 1},
                "perDeviceNodeSelection": true,
                "sharedCounters": [{"name": "mem", "counters": {"memory": {"value": "80Gi"}}}],
                "devices": [
                    {"name": "gpu-0", "nodeName": "node-1",
                     "consumesCounters": [{"counterSet": "mem", "counters": {"memory": {"value": "40Gi"}}}]},
                    {"name": "gpu-1", "allNodes": true, "bindsToNode": true},
                    {"name": "gpu-2", "nodeSelector": {"nodeSelectorTerms": [
                        {"matchExpressions": [{"key": "zone", "operator": "Exists"}]}
                    ]}, "bindingConditions": ["Attached"], "bindingFailureConditions": ["AttachFailed"]}
                ]
            }
        }));
        assert_eq!(slice.spec.node_scope, NodeScope::PerDevice);
        assert_eq!(slice.spec.devices[0].node_scope, DeviceNodeScope::NodeName("node-1".to_string()));
        assert_eq!(slice.spec.devices[1].node_scope, DeviceNodeScope::AllNodes);
        assert!(matches!(slice.spec.devices[2].node_scope, DeviceNodeScope::NodeSelector(_)));
    }

    #[test]
    fn attribute_union_rejects_two_members() {
        let bad = r#"{"int": 1, "bool": true}"#;
        assert!(serde_json::from_str::<DeviceAttribute>(bad).is_err());
        let good: DeviceAttribute = serde_json::from_str(r#"{"version": "1.2.3"}"#).unwrap();
        assert_eq!(good, DeviceAttribute::Version("1.2.3".to_string()));
    }

    #[test]
    fn too_many_devices_rejected() {
        let mut slice = gpu_slice();
        slice.spec.devices = (0..129).map(|i| Device::new(format!("gpu-{i}"))).collect();
        let errs = slice.validate().unwrap_err();
        assert!(errs.iter().any(|e| matches!(
            e,
            ValidationError::TooMany { max: 128, actual: 129, .. }
        )));
    }

    #[test]
    fn duplicate_device_names_rejected() {
        let mut slice = gpu_slice();
        slice.spec.devices.push(Device::new("gpu-0"));
        assert!(slice.validate().is_err());
    }

    #[test]
    fn long_string_attribute_rejected() {
        let mut slice = gpu_slice();
        slice.spec.devices[0]
            .attributes
            .insert("serial".to_string(), DeviceAttribute::String("x".repeat(65)));
        assert!(slice.validate().is_err());
    }

    #[test]
    fn invalid_version_attribute_rejected() {
        let mut slice = gpu_slice();
        slice.spec.devices[0]
            .attributes
            .insert("driverVersion".to_string(), DeviceAttribute::Version("1.x".to_string()));
        assert!(slice.validate().is_err());
    }

    #[test]
    fn counter_consumption_must_reference_existing_set() {
        let mut slice = gpu_slice();
        let mut counters = BTreeMap::new();
        counters.insert("memory".to_string(), Counter::new("4".parse().unwrap()));
        slice.spec.devices[0].consumes_counters.push(DeviceCounterConsumption {
            counter_set: "mem-slices".to_string(),
            counters,
        });
        assert!(slice.validate().is_err());

        let mut set = BTreeMap::new();
        set.insert("memory".to_string(), Counter::new("32".parse().unwrap()));
        slice.spec.shared_counters.push(CounterSet {
            name: "mem-slices".to_string(),
            counters: set,
        });
        assert_eq!(slice.validate(), Ok(()));
    }

    #[test]
    fn shared_counter_total_is_capped() {
        let mut slice = gpu_slice();
        for s in 0..3 {
            let counters = (0..11)
                .map(|i| (format!("c{i}"), Counter::new(Quantity::from_int(1))))
                .collect();
            slice.spec.shared_counters.push(CounterSet {
                name: format!("set-{s}"),
                counters,
            });
        }
        let errs = slice.validate().unwrap_err();
        assert!(errs.iter().any(|e| matches!(
            e,
            ValidationError::TooMany { max: 32, actual: 33, .. }
        )));
    }

    #[test]
    fn per_device_scope_must_be_set_on_every_device() {
        let mut slice = gpu_slice();
        slice.spec.node_scope = NodeScope::PerDevice;
        assert!(slice.validate().is_err());
        slice.spec.devices[0].node_scope = DeviceNodeScope::AllNodes;
        assert_eq!(slice.validate(), Ok(()));
    }

    #[test]
    fn device_scope_forbidden_without_per_device_mode() {
        let mut slice = gpu_slice();
        slice.spec.devices[0].node_scope = DeviceNodeScope::NodeName("node-2".to_string());
        assert!(slice.validate().is_err());
    }

    #[test]
    fn too_many_taints_rejected() {
        let mut slice = gpu_slice();
        slice.spec.devices[0].taints = (0..5)
            .map(|i| DeviceTaint {
                key: format!("k{i}"),
                value: String::new(),
                effect: TaintEffect::NoSchedule,
                time_added: None,
            })
            .collect();
        assert!(slice.validate().is_err());
    }

    #[test]
    fn taint_times_are_defaulted() {
        let mut slice = gpu_slice();
        slice.spec.devices[0].taints.push(DeviceTaint {
            key: "maint".to_string(),
            value: String::new(),
            effect: TaintEffect::NoExecute,
            time_added: None,
        });
        slice.spec.devices[0].taints.push(DeviceTaint {
            key: "old".to_string(),
            value: String::new(),
            effect: TaintEffect::NoSchedule,
            time_added: Some(5),
        });
        slice.default_taint_times(100);
        assert_eq!(slice.spec.devices[0].taints[0].time_added, Some(100));
        assert_eq!(slice.spec.devices[0].taints[1].time_added, Some(5));
    }

    #[test]
    fn attribute_lookup_defaults_to_driver_domain() {
        let slice = gpu_slice();
        let d = &slice.spec.devices[0];
        assert!(d.attribute("gpu.example.com", "gpu.example.com/model").is_some());
        assert!(d.attribute("gpu.example.com", "other.example.com/model").is_none());
    }

    #[test]
    fn availability_follows_node_scope() {
        let slice = gpu_slice();
        let d = &slice.spec.devices[0];
        assert!(slice.device_available_on(d, &NodeInfo::new("node-1")));
        assert!(!slice.device_available_on(d, &NodeInfo::new("node-2")));
    }

    #[test]
    fn version_equality_ignores_build_metadata() {
        let a = DeviceAttribute::Version("1.2.3+build1".to_string());
        let b = DeviceAttribute::Version("1.2.3+build2".to_string());
        assert!(a.same_value(&b));
        assert!(!a.same_value(&DeviceAttribute::String("1.2.3".to_string())));
    }
}
