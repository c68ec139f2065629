pub mod claim;
pub mod evict;
pub mod init;
pub mod objects;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use dra_allocator::BasicEvaluator;
use dra_controller::ClaimController;
use dra_core::DraConfig;
use dra_metrics::{AllocationMetrics, GroupVersionResource, IdentifierRegistry};
use dra_store::StateStore;

/// Metrics identifier of the claim controller.
pub const CONTROLLER_NAME: &str = "dractl";

/// Load `path`, else `./dra.toml` if present, else defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<DraConfig> {
    match path {
        Some(path) => DraConfig::from_file(path).with_context(|| format!("reading {}", path.display())),
        None => {
            let local = Path::new("dra.toml");
            if local.exists() {
                DraConfig::from_file(local).context("reading dra.toml")
            } else {
                Ok(DraConfig::default())
            }
        }
    }
}

pub fn open_store(config: &DraConfig) -> anyhow::Result<StateStore> {
    StateStore::open(&config.store.path)
        .with_context(|| format!("opening store {}", config.store.path.display()))
}

pub fn controller(store: StateStore, config: &DraConfig) -> anyhow::Result<ClaimController> {
    let registry = IdentifierRegistry::new();
    let gvr = GroupVersionResource::new("resource.k8s.io", "v1", "resourceclaims");
    let identifier = registry.register(CONTROLLER_NAME, &gvr)?;
    let metrics = Arc::new(AllocationMetrics::new(identifier));
    Ok(ClaimController::new(
        store,
        BasicEvaluator,
        config.allocator.clone(),
        metrics,
    )?)
}

/// Read a JSON object from `path`.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[allocator]\nnode_name = \"node-9\"\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.allocator.node_name.as_deref(), Some("node-9"));
    }

    #[test]
    fn test_missing_explicit_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_controller_over_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DraConfig::default();
        config.store.path = dir.path().join("state.redb");
        let store = open_store(&config).unwrap();
        let controller = controller(store, &config).unwrap();
        assert!(controller.metrics().identifier().is_unique());
    }
}
