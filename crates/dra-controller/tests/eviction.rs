mod common;

use common::*;
use dra_controller::ControllerError;
use dra_core::{ConsumerReference, Slice};
use dra_metrics::IdentifierRegistry;
use dra_store::StateStore;
use serde_json::json;

const T: u64 = 1_700_000_000;

fn gpu_slice(taints: serde_json::Value) -> Slice {
    slice("node-1-gpus", "node-1", json!([{"name": "gpu-0", "taints": taints}]))
}

fn tolerating(seconds: Option<i64>) -> serde_json::Value {
    let mut toleration = json!({"key": "gpu-maint", "operator": "Exists", "effect": "NoExecute"});
    if let Some(s) = seconds {
        toleration["tolerationSeconds"] = json!(s);
    }
    json!({"tolerations": [toleration]})
}

async fn reserved_claim(store: &StateStore, controller: &dra_controller::ClaimController, request: serde_json::Value) {
    store.create_claim(&claim("train", request)).unwrap();
    controller.allocate("default/train", None).await.unwrap();
    controller
        .reserve("default/train", ConsumerReference::new("pods", "trainer", "uid-1"))
        .await
        .unwrap();
}

fn setup() -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    store.put_class(&gpu_class()).unwrap();
    store.put_slice(&gpu_slice(json!([]))).unwrap();
    store
}

#[tokio::test]
async fn toleration_seconds_set_the_deadline() {
    let store = setup();
    let registry = IdentifierRegistry::new();
    let controller = test_controller(&store, &registry);
    reserved_claim(&store, &controller, tolerating(Some(60))).await;

    store
        .put_slice(&gpu_slice(
            json!([{"key": "gpu-maint", "effect": "NoExecute", "timeAdded": T}]),
        ))
        .unwrap();

    let plan = controller.eviction_plan("default/train", T).unwrap();
    assert_eq!(plan.deadline(), Some(T + 60));
    assert_eq!(plan.orders.len(), 1);

    assert!(controller.sweep_evictions(T + 59).await.unwrap().evicted.is_empty());
    let sweep = controller.sweep_evictions(T + 60).await.unwrap();
    assert!(sweep.is_complete());
    let evicted = sweep.evicted;
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].consumer.uid, "uid-1");
    assert_eq!(evicted[0].deadline, T + 60);

    let claim = store.get_claim("default/train").unwrap().unwrap();
    assert!(claim.status.reserved_for.is_empty());
    assert_eq!(controller.metrics().snapshot().unwrap().evictions, 1);

    // Eligible for deallocation now that nobody holds it.
    controller.deallocate("default/train").await.unwrap();
}

#[tokio::test]
async fn new_reservations_are_refused_while_tainted() {
    let store = setup();
    let registry = IdentifierRegistry::new();
    let controller = test_controller(&store, &registry);
    reserved_claim(&store, &controller, tolerating(Some(60))).await;

    store
        .put_slice(&gpu_slice(
            json!([{"key": "gpu-maint", "effect": "NoExecute", "timeAdded": T}]),
        ))
        .unwrap();
    let err = controller
        .reserve("default/train", ConsumerReference::new("pods", "late", "uid-2"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::EvictionScheduled { deadline, .. } if deadline == T + 60));
}

#[tokio::test]
async fn untolerated_taint_evicts_at_once() {
    let store = setup();
    let registry = IdentifierRegistry::new();
    let controller = test_controller(&store, &registry);
    reserved_claim(&store, &controller, json!({})).await;

    store
        .put_slice(&gpu_slice(
            json!([{"key": "gpu-maint", "effect": "NoExecute", "timeAdded": T}]),
        ))
        .unwrap();
    assert_eq!(controller.sweep_evictions(T).await.unwrap().evicted.len(), 1);
}

#[tokio::test]
async fn indefinite_toleration_keeps_consumers() {
    let store = setup();
    let registry = IdentifierRegistry::new();
    let controller = test_controller(&store, &registry);
    reserved_claim(&store, &controller, tolerating(None)).await;

    store
        .put_slice(&gpu_slice(
            json!([{"key": "gpu-maint", "effect": "NoExecute", "timeAdded": T}]),
        ))
        .unwrap();
    assert!(controller.sweep_evictions(T + 3600).await.unwrap().evicted.is_empty());
    assert!(!controller.eviction_plan("default/train", T).unwrap().is_scheduled());
}
