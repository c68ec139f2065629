#![allow(dead_code)]

use std::sync::Arc;

use dra_allocator::BasicEvaluator;
use dra_controller::ClaimController;
use dra_core::config::AllocatorConfig;
use dra_core::{Claim, DeviceClass, Slice};
use dra_metrics::{AllocationMetrics, GroupVersionResource, IdentifierRegistry};
use dra_store::StateStore;
use serde_json::{Value, json};

pub const DRIVER: &str = "gpu.example.com";

pub fn test_config() -> AllocatorConfig {
    AllocatorConfig {
        max_attempts: 5,
        retry_backoff_ms: 1,
        node_name: None,
    }
}

pub fn test_controller(store: &StateStore, registry: &IdentifierRegistry) -> ClaimController {
    let gvr = GroupVersionResource::new("resource.k8s.io", "v1", "resourceclaims");
    let id = registry.register("claims", &gvr).unwrap();
    ClaimController::new(
        store.clone(),
        BasicEvaluator,
        test_config(),
        Arc::new(AllocationMetrics::new(id)),
    )
    .unwrap()
}

pub fn slice(name: &str, pool: &str, devices: Value) -> Slice {
    slice_with(name, pool, devices, json!([]))
}

pub fn slice_with(name: &str, pool: &str, devices: Value, shared_counters: Value) -> Slice {
    serde_json::from_value(json!({
        "metadata": {"name": name},
        "spec": {
            "driver": DRIVER,
            "pool": {"name": pool, "generation": 1, "resourceSliceCount": 1},
            "nodeName": "node-1",
            "devices": devices,
            "sharedCounters": shared_counters,
        }
    }))
    .unwrap()
}

pub fn class(name: &str, expression: &str) -> DeviceClass {
    serde_json::from_value(json!({
        "metadata": {"name": name},
        "spec": {"selectors": [{"cel": {"expression": expression}}]}
    }))
    .unwrap()
}

pub fn gpu_class() -> DeviceClass {
    class("gpu", &format!("device.driver == \"{DRIVER}\""))
}

/// A claim for one device of class `gpu`, with extra request fields.
pub fn claim(name: &str, exactly: Value) -> Claim {
    let mut request = json!({"deviceClassName": "gpu"});
    if let (Some(target), Value::Object(extra)) = (request.as_object_mut(), exactly) {
        target.extend(extra);
    }
    serde_json::from_value(json!({
        "metadata": {"namespace": "default", "name": name},
        "spec": {"devices": {"requests": [{"name": "gpu", "exactly": request}]}}
    }))
    .unwrap()
}
