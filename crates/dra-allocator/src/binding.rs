//! Binding gate.
//!
//! A device that declares binding conditions is not ready for use until
//! every one of them is `True` in the claim's per-device status, and is
//! unusable as soon as any of its binding-failure conditions is `True`.
//! Conditions are read from the status passed in on every check.

use dra_core::{AllocatedDeviceStatus, AllocationResult, ConditionStatus, DeviceId};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingOutcome {
    /// Every device may be bound.
    Ready,
    /// `device` still waits for `conditions`.
    Pending { device: DeviceId, conditions: Vec<String> },
    /// `condition` reported failure on `device`. The allocation should be
    /// released.
    Failed { device: DeviceId, condition: String },
}

impl BindingOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, BindingOutcome::Ready)
    }
}

pub struct BindingGate;

impl BindingGate {
    /// Failures take precedence over pending conditions, in result order.
    pub fn check(result: &AllocationResult, statuses: &[AllocatedDeviceStatus]) -> BindingOutcome {
        let status_of = |id: &DeviceId, condition: &str| {
            statuses
                .iter()
                .find(|s| s.device_id() == *id)
                .and_then(|s| s.condition(condition))
        };

        for entry in &result.results {
            let id = entry.device_id();
            if let Some(failed) = entry
                .binding_failure_conditions
                .iter()
                .find(|c| status_of(&id, c) == Some(ConditionStatus::True))
            {
                debug!(device = %id, condition = %failed, "binding failed");
                return BindingOutcome::Failed {
                    device: id,
                    condition: failed.clone(),
                };
            }
        }

        for entry in &result.results {
            let id = entry.device_id();
            let waiting: Vec<String> = entry
                .binding_conditions
                .iter()
                .filter(|c| status_of(&id, c) != Some(ConditionStatus::True))
                .cloned()
                .collect();
            if !waiting.is_empty() {
                debug!(device = %id, ?waiting, "binding pending");
                return BindingOutcome::Pending {
                    device: id,
                    conditions: waiting,
                };
            }
        }
        BindingOutcome::Ready
    }
}
