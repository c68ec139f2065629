//! Claim status: allocation result, reservations and per-device status.
//!
//! ```text
//!   unallocated ──set_allocation──▶ allocated ──reserve──▶ reserved
//!        ▲                            │   ▲                    │
//!        └────── clear_allocation ────┘   └──── unreserve ─────┘
//! ```
//!
//! The result snapshots tolerations and binding conditions of every device
//! as they were when the allocation was made. Later changes to the device
//! do not flow into an existing result.

use std::collections::HashSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{BINDING_CONDITIONS_MAX, BINDING_FAILURE_CONDITIONS_MAX, DeviceId};
use crate::claim::{DeviceConfiguration, DeviceToleration};
use crate::error::{ValidationErrors, ValidationResult};
use crate::names;
use crate::node_selector::NodeSelector;

pub const ALLOCATION_RESULTS_MAX: usize = 32;
pub const RESERVED_FOR_MAX: usize = 256;
pub const DEVICE_STATUS_MAX_CONDITIONS: usize = 8;
pub const DEVICE_STATUS_MAX_DATA: usize = 10 * 1024;
pub const NETWORK_MAX_IPS: usize = 16;
pub const NETWORK_MAX_INTERFACE_NAME: usize = 256;
pub const NETWORK_MAX_HARDWARE_ADDRESS: usize = 128;

/// Rejected status transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("claim is not allocated")]
    NotAllocated,

    #[error("claim is already allocated")]
    AlreadyAllocated,

    #[error("reservedFor is full ({max} entries)")]
    ReservedForFull { max: usize },

    #[error("claim is still reserved by {count} consumer(s)")]
    StillReserved { count: usize },

    #[error("device {device} is not part of the allocation")]
    DeviceNotAllocated { device: String },

    #[error("invalid status: {0}")]
    Invalid(#[from] ValidationErrors),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reserved_for: Vec<ConsumerReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<AllocatedDeviceStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPhase {
    Unallocated,
    Allocated,
    Reserved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub results: Vec<DeviceRequestAllocationResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<DeviceAllocationConfiguration>,
    /// Where the allocated devices are usable. `None` means every node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,
    /// Unix timestamp (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequestAllocationResult {
    /// `main` or `main/sub` for `firstAvailable` requests.
    pub request: String,
    pub driver: String,
    pub pool: String,
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_access: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<DeviceToleration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binding_conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binding_failure_conditions: Vec<String>,
}

impl DeviceRequestAllocationResult {
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.driver.clone(), self.pool.clone(), self.device.clone())
    }

    pub fn admin_access(&self) -> bool {
        self.admin_access.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationConfigSource {
    FromClass,
    FromClaim,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAllocationConfiguration {
    pub source: AllocationConfigSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<String>,
    #[serde(flatten)]
    pub config: DeviceConfiguration,
}

/// A consumer holding a reservation on the claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_group: String,
    pub resource: String,
    pub name: String,
    pub uid: String,
}

impl ConsumerReference {
    pub fn new(resource: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            api_group: String::new(),
            resource: resource.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }
}

// ── Per-device status ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedDeviceStatus {
    pub driver: String,
    pub pool: String,
    pub device: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_data: Option<NetworkDeviceData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: String::new(),
            message: String::new(),
            last_transition_time: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDeviceData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interface_name: String,
    /// CIDR notation, e.g. `10.9.8.7/24`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hardware_address: String,
}

fn is_cidr(s: &str) -> bool {
    let Some((addr, prefix)) = s.split_once('/') else {
        return false;
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };
    let max = if addr.is_ipv4() { 32 } else { 128 };
    prefix.parse::<u8>().is_ok_and(|p| p <= max)
}

impl AllocatedDeviceStatus {
    pub fn new(id: &DeviceId) -> Self {
        Self {
            driver: id.driver.clone(),
            pool: id.pool.clone(),
            device: id.device.clone(),
            conditions: Vec::new(),
            data: None,
            network_data: None,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.driver.clone(), self.pool.clone(), self.device.clone())
    }

    /// Reported status of condition `type_`, if any.
    pub fn condition(&self, type_: &str) -> Option<ConditionStatus> {
        self.conditions.iter().find(|c| c.type_ == type_).map(|c| c.status)
    }

    fn validate(&self, errs: &mut ValidationErrors, field: &str) {
        names::validate_driver_name(errs, &format!("{field}.driver"), &self.driver);
        names::validate_pool_name(errs, &format!("{field}.pool"), &self.pool);
        names::validate_dns_label(errs, &format!("{field}.device"), &self.device);

        errs.max_items(
            format!("{field}.conditions"),
            DEVICE_STATUS_MAX_CONDITIONS,
            self.conditions.len(),
        );
        let mut types = HashSet::new();
        for c in &self.conditions {
            let cf = format!("{field}.conditions");
            names::validate_label_name(errs, &cf, &c.type_);
            if !types.insert(c.type_.as_str()) {
                errs.duplicate(cf, &c.type_);
            }
        }

        if let Some(data) = &self.data {
            let len = data.to_string().len();
            if len > DEVICE_STATUS_MAX_DATA {
                errs.too_long(format!("{field}.data"), DEVICE_STATUS_MAX_DATA, len);
            }
        }

        if let Some(net) = &self.network_data {
            let nf = format!("{field}.networkData");
            if net.interface_name.len() > NETWORK_MAX_INTERFACE_NAME {
                errs.too_long(
                    format!("{nf}.interfaceName"),
                    NETWORK_MAX_INTERFACE_NAME,
                    net.interface_name.len(),
                );
            }
            if net.hardware_address.len() > NETWORK_MAX_HARDWARE_ADDRESS {
                errs.too_long(
                    format!("{nf}.hardwareAddress"),
                    NETWORK_MAX_HARDWARE_ADDRESS,
                    net.hardware_address.len(),
                );
            }
            errs.max_items(format!("{nf}.ips"), NETWORK_MAX_IPS, net.ips.len());
            let mut seen = HashSet::new();
            for ip in &net.ips {
                if !is_cidr(ip) {
                    errs.invalid(format!("{nf}.ips"), ip, "must be in CIDR notation");
                }
                if !seen.insert(ip.as_str()) {
                    errs.duplicate(format!("{nf}.ips"), ip);
                }
            }
        }
    }
}

// ── Transitions ───────────────────────────────────────────────────

impl ClaimStatus {
    pub fn phase(&self) -> ClaimPhase {
        match (&self.allocation, self.reserved_for.is_empty()) {
            (None, _) => ClaimPhase::Unallocated,
            (Some(_), true) => ClaimPhase::Allocated,
            (Some(_), false) => ClaimPhase::Reserved,
        }
    }

    pub fn set_allocation(&mut self, result: AllocationResult) -> Result<(), StatusError> {
        if self.allocation.is_some() {
            return Err(StatusError::AlreadyAllocated);
        }
        let mut errs = ValidationErrors::default();
        result.validate(&mut errs, "status.allocation");
        errs.into_result()?;
        self.allocation = Some(result);
        Ok(())
    }

    /// Add a consumer. Returns `Ok(false)` if a consumer with the same uid
    /// is already present.
    pub fn reserve(&mut self, consumer: ConsumerReference) -> Result<bool, StatusError> {
        if self.allocation.is_none() {
            return Err(StatusError::NotAllocated);
        }
        if self.reserved_for.iter().any(|c| c.uid == consumer.uid) {
            return Ok(false);
        }
        if self.reserved_for.len() >= RESERVED_FOR_MAX {
            return Err(StatusError::ReservedForFull {
                max: RESERVED_FOR_MAX,
            });
        }
        self.reserved_for.push(consumer);
        Ok(true)
    }

    /// Remove a consumer by uid. Returns whether it was present.
    pub fn unreserve(&mut self, uid: &str) -> bool {
        let before = self.reserved_for.len();
        self.reserved_for.retain(|c| c.uid != uid);
        self.reserved_for.len() != before
    }

    /// Release the allocation. Refused while any consumer holds a
    /// reservation. Per-device status goes with it.
    pub fn clear_allocation(&mut self) -> Result<AllocationResult, StatusError> {
        if !self.reserved_for.is_empty() {
            return Err(StatusError::StillReserved {
                count: self.reserved_for.len(),
            });
        }
        let result = self.allocation.take().ok_or(StatusError::NotAllocated)?;
        self.devices.clear();
        Ok(result)
    }

    /// Insert or replace the status of one allocated device.
    pub fn set_device_status(&mut self, status: AllocatedDeviceStatus) -> Result<(), StatusError> {
        let id = status.device_id();
        let allocation = self.allocation.as_ref().ok_or(StatusError::NotAllocated)?;
        if !allocation.results.iter().any(|r| r.device_id() == id) {
            return Err(StatusError::DeviceNotAllocated {
                device: id.to_string(),
            });
        }
        let mut errs = ValidationErrors::default();
        status.validate(&mut errs, "status.devices");
        errs.into_result()?;
        match self.devices.iter_mut().find(|d| d.device_id() == id) {
            Some(existing) => *existing = status,
            None => self.devices.push(status),
        }
        Ok(())
    }

    pub fn device_status(&self, id: &DeviceId) -> Option<&AllocatedDeviceStatus> {
        self.devices.iter().find(|d| d.device_id() == *id)
    }

    pub fn validate(&self) -> ValidationResult {
        let mut errs = ValidationErrors::default();
        if let Some(a) = &self.allocation {
            a.validate(&mut errs, "status.allocation");
        } else if !self.reserved_for.is_empty() {
            errs.forbidden("status.reservedFor", "requires an allocation");
        }

        errs.max_items("status.reservedFor", RESERVED_FOR_MAX, self.reserved_for.len());
        let mut uids = HashSet::new();
        for (i, c) in self.reserved_for.iter().enumerate() {
            let cf = format!("status.reservedFor[{i}]");
            if c.resource.is_empty() {
                errs.required(format!("{cf}.resource"));
            }
            if c.name.is_empty() {
                errs.required(format!("{cf}.name"));
            }
            if c.uid.is_empty() {
                errs.required(format!("{cf}.uid"));
            } else if !uids.insert(c.uid.as_str()) {
                errs.duplicate(format!("{cf}.uid"), &c.uid);
            }
        }

        let allocated: HashSet<DeviceId> = self
            .allocation
            .iter()
            .flat_map(|a| a.results.iter().map(|r| r.device_id()))
            .collect();
        let mut seen = HashSet::new();
        for (i, d) in self.devices.iter().enumerate() {
            let df = format!("status.devices[{i}]");
            d.validate(&mut errs, &df);
            let id = d.device_id();
            if !allocated.contains(&id) {
                errs.invalid(df.clone(), id.to_string(), "device is not part of the allocation");
            }
            if !seen.insert(id.clone()) {
                errs.duplicate(df, id.to_string());
            }
        }
        errs.into_result()
    }
}

impl AllocationResult {
    fn validate(&self, errs: &mut ValidationErrors, field: &str) {
        errs.max_items(format!("{field}.results"), ALLOCATION_RESULTS_MAX, self.results.len());
        for (i, r) in self.results.iter().enumerate() {
            let rf = format!("{field}.results[{i}]");
            names::validate_driver_name(errs, &format!("{rf}.driver"), &r.driver);
            names::validate_pool_name(errs, &format!("{rf}.pool"), &r.pool);
            names::validate_dns_label(errs, &format!("{rf}.device"), &r.device);
            errs.max_items(
                format!("{rf}.bindingConditions"),
                BINDING_CONDITIONS_MAX,
                r.binding_conditions.len(),
            );
            errs.max_items(
                format!("{rf}.bindingFailureConditions"),
                BINDING_FAILURE_CONDITIONS_MAX,
                r.binding_failure_conditions.len(),
            );
        }
        if let Some(sel) = &self.node_selector {
            sel.validate(errs, &format!("{field}.nodeSelector"));
        }
        for (i, c) in self.config.iter().enumerate() {
            c.config.validate(errs, &format!("{field}.config[{i}]"));
        }
    }

    pub fn device_ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.results.iter().map(|r| r.device_id())
    }
}
