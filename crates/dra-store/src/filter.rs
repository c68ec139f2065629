//! Exact-match field filters for listing slices.

use dra_core::{SLICE_SELECTOR_DRIVER, SLICE_SELECTOR_NODE_NAME, Slice};

use crate::error::{StateError, StateResult};

/// Filters slices by node name and/or driver. Unset fields match all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceFilter {
    pub node_name: Option<String>,
    pub driver: Option<String>,
}

impl SliceFilter {
    pub fn node(name: impl Into<String>) -> Self {
        Self {
            node_name: Some(name.into()),
            driver: None,
        }
    }

    pub fn driver(name: impl Into<String>) -> Self {
        Self {
            node_name: None,
            driver: Some(name.into()),
        }
    }

    /// Parse a field selector such as `spec.nodeName=node-1,spec.driver=gpu.example.com`.
    pub fn parse(selector: &str) -> StateResult<Self> {
        let mut filter = Self::default();
        for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let Some((field, value)) = term.split_once('=') else {
                return Err(StateError::InvalidSelector(format!("{term}: expected field=value")));
            };
            let value = value.trim_start_matches('=').to_string();
            match field.trim() {
                SLICE_SELECTOR_NODE_NAME => filter.node_name = Some(value),
                SLICE_SELECTOR_DRIVER => filter.driver = Some(value),
                other => {
                    return Err(StateError::InvalidSelector(format!(
                        "{other}: only {SLICE_SELECTOR_NODE_NAME} and {SLICE_SELECTOR_DRIVER} are supported"
                    )));
                }
            }
        }
        Ok(filter)
    }

    pub fn matches(&self, slice: &Slice) -> bool {
        self.node_name
            .as_deref()
            .is_none_or(|n| slice.node_name() == Some(n))
            && self.driver.as_deref().is_none_or(|d| slice.spec.driver == d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_both_fields() {
        let f = SliceFilter::parse("spec.nodeName=node-1, spec.driver==gpu.example.com").unwrap();
        assert_eq!(f.node_name.as_deref(), Some("node-1"));
        assert_eq!(f.driver.as_deref(), Some("gpu.example.com"));
    }

    #[test]
    fn parse_empty_matches_all() {
        assert_eq!(SliceFilter::parse("").unwrap(), SliceFilter::default());
    }

    #[test]
    fn parse_rejects_unknown_field() {
        assert!(matches!(
            SliceFilter::parse("spec.pool=x"),
            Err(StateError::InvalidSelector(_))
        ));
        assert!(SliceFilter::parse("spec.driver").is_err());
    }
}
