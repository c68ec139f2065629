//! Object file handling: validate, publish, list.

use std::path::Path;

use anyhow::Context;
use clap::ValueEnum;
use dra_allocator::{PoolCatalog, PoolState};
use dra_core::{Claim, ClaimTemplate, DeviceClass, Slice};
use dra_store::{SliceFilter, StateStore};

use super::read_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    Slice,
    Claim,
    Class,
    Template,
}

pub fn validate(kind: Kind, file: &Path) -> anyhow::Result<()> {
    let result = match kind {
        Kind::Slice => read_json::<Slice>(file)?.validate(),
        Kind::Claim => read_json::<Claim>(file)?.validate(),
        Kind::Class => read_json::<DeviceClass>(file)?.validate(),
        Kind::Template => read_json::<ClaimTemplate>(file)?.validate(),
    };
    match result {
        Ok(()) => {
            println!("✓ {} is valid", file.display());
            Ok(())
        }
        Err(errs) => {
            for err in &errs.0 {
                eprintln!("  {err}");
            }
            anyhow::bail!("{} has {} validation error(s)", file.display(), errs.0.len())
        }
    }
}

// ── Slices ────────────────────────────────────────────────────────

pub fn publish_slice(store: &StateStore, file: &Path) -> anyhow::Result<()> {
    let slice: Slice = read_json(file)?;
    let stored = store.put_slice(&slice)?;
    println!(
        "✓ Published slice {} ({} devices, pool {} generation {})",
        stored.metadata.name,
        stored.spec.devices.len(),
        stored.spec.pool.name,
        stored.spec.pool.generation
    );
    Ok(())
}

pub fn list_slices(
    store: &StateStore,
    node: Option<String>,
    driver: Option<String>,
    selector: Option<&str>,
    pools: bool,
) -> anyhow::Result<()> {
    let filter = match selector {
        Some(selector) => SliceFilter::parse(selector)?,
        None => SliceFilter {
            node_name: node,
            driver,
        },
    };
    let slices = store.list_slices(&filter)?;

    if pools {
        let catalog = PoolCatalog::build(slices);
        for pool in catalog.pools() {
            let state = match &pool.state {
                PoolState::Complete => "complete".to_string(),
                PoolState::Incomplete { expected, observed } => {
                    format!("incomplete ({observed}/{expected} slices)")
                }
                PoolState::Invalid { reason } => format!("invalid: {reason}"),
            };
            println!("{}  generation {}  {}", pool.id, pool.generation, state);
        }
        return Ok(());
    }

    for slice in &slices {
        println!(
            "{}  {}  pool {}@{}  {} devices",
            slice.metadata.name,
            slice.spec.driver,
            slice.spec.pool.name,
            slice.spec.pool.generation,
            slice.spec.devices.len()
        );
    }
    Ok(())
}

pub fn delete_slice(store: &StateStore, name: &str) -> anyhow::Result<()> {
    if !store.delete_slice(name)? {
        anyhow::bail!("slice {name} not found");
    }
    println!("✓ Deleted slice {name}");
    Ok(())
}

// ── Classes ───────────────────────────────────────────────────────

pub fn apply_class(store: &StateStore, file: &Path) -> anyhow::Result<()> {
    let class: DeviceClass = read_json(file)?;
    let stored = store.put_class(&class)?;
    println!("✓ Applied class {} (version {})", stored.name(), stored.metadata.resource_version);
    Ok(())
}

pub fn list_classes(store: &StateStore) -> anyhow::Result<()> {
    for class in store.list_classes()? {
        println!(
            "{}  {} selectors  {} configs",
            class.name(),
            class.spec.selectors.len(),
            class.spec.config.len()
        );
    }
    Ok(())
}

// ── Claims ────────────────────────────────────────────────────────

pub fn create_claim(store: &StateStore, file: &Path) -> anyhow::Result<()> {
    let claim: Claim = read_json(file)?;
    let stored = store.create_claim(&claim)?;
    println!("✓ Created claim {}", stored.key());
    Ok(())
}

pub fn put_template(store: &StateStore, file: &Path) -> anyhow::Result<()> {
    let template: ClaimTemplate = read_json(file)?;
    let stored = store.put_template(&template)?;
    println!("✓ Stored template {}", stored.metadata.key());
    Ok(())
}

pub fn claim_from_template(store: &StateStore, template: &str, name: &str) -> anyhow::Result<()> {
    let template = store
        .get_template(template)?
        .with_context(|| format!("template {template} not found"))?;
    let stored = store.create_claim(&template.instantiate(name))?;
    println!("✓ Created claim {} from template {}", stored.key(), template.metadata.key());
    Ok(())
}

pub fn show_claim(store: &StateStore, key: &str) -> anyhow::Result<()> {
    let claim = store
        .get_claim(key)?
        .with_context(|| format!("claim {key} not found"))?;
    println!("{}", serde_json::to_string_pretty(&claim)?);
    Ok(())
}

pub fn list_claims(store: &StateStore) -> anyhow::Result<()> {
    for claim in store.list_claims()? {
        let devices = claim
            .status
            .allocation
            .as_ref()
            .map_or(0, |a| a.results.len());
        println!(
            "{}  {:?}  {} devices  {} consumers",
            claim.key(),
            claim.status.phase(),
            devices,
            claim.status.reserved_for.len()
        );
    }
    Ok(())
}

pub fn delete_claim(store: &StateStore, key: &str) -> anyhow::Result<()> {
    if !store.delete_claim(key)? {
        anyhow::bail!("claim {key} not found");
    }
    println!("✓ Deleted claim {key}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, value: serde_json::Value) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, value.to_string()).unwrap();
        path
    }

    fn slice_json(name: &str) -> serde_json::Value {
        json!({
            "metadata": { "name": name },
            "spec": {
                "driver": "gpu.example.com",
                "pool": { "name": "node-1", "generation": 1, "resourceSliceCount": 1 },
                "nodeName": "node-1",
                "devices": [{ "name": "gpu-0" }]
            }
        })
    }

    #[test]
    fn test_validate_rejects_bad_slice() {
        let dir = tempfile::tempdir().unwrap();
        let good = write(dir.path(), "good.json", slice_json("s1"));
        let bad = write(dir.path(), "bad.json", slice_json("Not_A_Name"));
        validate(Kind::Slice, &good).unwrap();
        assert!(validate(Kind::Slice, &bad).is_err());
    }

    #[test]
    fn test_publish_then_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        publish_slice(&store, &write(dir.path(), "s1.json", slice_json("s1"))).unwrap();
        list_slices(&store, Some("node-1".to_string()), None, None, true).unwrap();
        assert_eq!(store.list_slices(&SliceFilter::node("node-1")).unwrap().len(), 1);
        assert!(store.list_slices(&SliceFilter::node("node-2")).unwrap().is_empty());
        delete_slice(&store, "s1").unwrap();
        assert!(delete_slice(&store, "s1").is_err());
    }

    #[test]
    fn test_claim_from_template() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let template = write(
            dir.path(),
            "tmpl.json",
            json!({
                "metadata": { "name": "gpu-tmpl", "namespace": "ml" },
                "spec": { "spec": { "devices": { "requests": [
                    { "name": "gpu", "exactly": { "deviceClassName": "gpu" } }
                ] } } }
            }),
        );
        put_template(&store, &template).unwrap();
        claim_from_template(&store, "ml/gpu-tmpl", "worker-0").unwrap();
        let claim = store.get_claim("ml/worker-0").unwrap().unwrap();
        assert_eq!(claim.spec.devices.requests.len(), 1);
        assert!(claim_from_template(&store, "ml/missing", "worker-1").is_err());
    }
}
