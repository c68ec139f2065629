//! Minimal object metadata.
//!
//! Only what the allocation model needs: identity for keys and a
//! resource version for compare-and-swap status writes.

use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::names;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    /// Empty for cluster-scoped objects (slices, classes).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Bumped by the store on every write. Zero means "never stored".
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// `{namespace}/{name}` for namespaced objects, `{name}` otherwise.
    pub fn key(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    pub(crate) fn validate(&self, errs: &mut ValidationErrors, namespaced: bool) {
        names::validate_dns_subdomain(errs, "metadata.name", &self.name);
        if namespaced {
            names::validate_dns_label(errs, "metadata.namespace", &self.namespace);
        } else if !self.namespace.is_empty() {
            errs.forbidden("metadata.namespace", "not allowed on cluster-scoped objects");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_includes_namespace_when_set() {
        assert_eq!(ObjectMeta::namespaced("ml", "train").key(), "ml/train");
        assert_eq!(ObjectMeta::named("gpu-basic").key(), "gpu-basic");
    }

    #[test]
    fn cluster_scoped_rejects_namespace() {
        let mut errs = ValidationErrors::default();
        ObjectMeta::namespaced("ml", "slice-a").validate(&mut errs, false);
        assert_eq!(errs.len(), 1);
    }
}
