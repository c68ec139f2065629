//! Identifier registry.
//!
//! Tracks (name, resource) keys so two observers never publish metrics
//! under the same label. The registry is an ordinary value: create one per
//! process (or per test) and share it by reference.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::IdentifierError;

/// The kind of object an observer watches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.group.is_empty() && self.version.is_empty() && self.resource.is_empty()
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Resource={}", self.group, self.version, self.resource)
    }
}

/// Names an observer for metrics and logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identifier {
    name: String,
    gvr: GroupVersionResource,
    unique: bool,
}

impl Identifier {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> &GroupVersionResource {
        &self.gvr
    }

    /// Named and not shared with any other identifier. Only unique
    /// identifiers get metrics.
    pub fn is_unique(&self) -> bool {
        self.unique
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (gvr={})", self.name, self.gvr)
    }
}

#[derive(Debug, Default)]
pub struct IdentifierRegistry {
    keys: Mutex<HashSet<(String, GroupVersionResource)>>,
}

impl IdentifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` for `gvr`.
    ///
    /// An empty name or resource is accepted but never unique. A collision
    /// returns [`IdentifierError::NotUnique`] carrying the non-unique
    /// identifier.
    pub fn register(&self, name: &str, gvr: &GroupVersionResource) -> Result<Identifier, IdentifierError> {
        let mut id = Identifier {
            name: name.to_string(),
            gvr: gvr.clone(),
            unique: false,
        };
        if name.is_empty() || gvr.is_empty() {
            debug!(%name, "unnamed identifier, metrics disabled");
            return Ok(id);
        }

        let inserted = self
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((name.to_string(), gvr.clone()));
        if !inserted {
            warn!(identifier = %id, "duplicate identifier");
            return Err(IdentifierError::NotUnique { identifier: id });
        }
        id.unique = true;
        Ok(id)
    }

    /// Forget every registered key.
    pub fn clear(&self) {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pods() -> GroupVersionResource {
        GroupVersionResource::new("", "v1", "pods")
    }

    fn config_maps() -> GroupVersionResource {
        GroupVersionResource::new("", "v1", "configmaps")
    }

    #[test]
    fn first_registration_is_unique() {
        let registry = IdentifierRegistry::new();
        let id = registry.register("my-fifo", &pods()).unwrap();
        assert!(id.is_unique());
        assert_eq!(id.name(), "my-fifo");
    }

    #[test]
    fn same_name_different_resource_is_unique() {
        let registry = IdentifierRegistry::new();
        registry.register("my-fifo", &pods()).unwrap();
        assert!(registry.register("my-fifo", &config_maps()).unwrap().is_unique());
    }

    #[test]
    fn different_name_same_resource_is_unique() {
        let registry = IdentifierRegistry::new();
        registry.register("fifo-1", &pods()).unwrap();
        assert!(registry.register("fifo-2", &pods()).unwrap().is_unique());
    }

    #[test]
    fn duplicate_is_an_error() {
        let registry = IdentifierRegistry::new();
        registry.register("my-fifo", &pods()).unwrap();
        let Err(IdentifierError::NotUnique { identifier }) = registry.register("my-fifo", &pods()) else {
            panic!("expected a collision");
        };
        assert!(!identifier.is_unique());
        assert_eq!(identifier.name(), "my-fifo");
    }

    #[test]
    fn unnamed_is_never_unique() {
        let registry = IdentifierRegistry::new();
        assert!(!registry.register("", &pods()).unwrap().is_unique());
        assert!(!registry.register("x", &GroupVersionResource::default()).unwrap().is_unique());
        assert!(registry.is_empty());
    }

    #[test]
    fn registries_are_independent() {
        let a = IdentifierRegistry::new();
        let b = IdentifierRegistry::new();
        a.register("ctl", &pods()).unwrap();
        assert!(b.register("ctl", &pods()).unwrap().is_unique());
    }

    #[test]
    fn clear_forgets_keys() {
        let registry = IdentifierRegistry::new();
        registry.register("ctl", &pods()).unwrap();
        registry.clear();
        assert!(registry.register("ctl", &pods()).unwrap().is_unique());
    }

    #[test]
    fn concurrent_registration_has_one_winner() {
        let registry = std::sync::Arc::new(IdentifierRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register("ctl", &pods()).is_ok())
            })
            .collect();
        let wins = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(wins, 1);
    }
}
