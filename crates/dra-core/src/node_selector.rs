//! Node selectors used for node scoping of slices, devices and
//! allocation results.
//!
//! Terms are ORed, requirements inside a term are ANDed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::names;

/// The only field supported by `matchFields`.
pub const NODE_NAME_FIELD: &str = "metadata.name";

/// The node an allocation is being made for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: HashMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTerm {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<NodeSelectorRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<NodeSelectorRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: NodeSelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

impl NodeSelector {
    /// A selector matching exactly one node by name.
    pub fn for_node(node_name: &str) -> Self {
        Self {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Vec::new(),
                match_fields: vec![NodeSelectorRequirement {
                    key: NODE_NAME_FIELD.to_string(),
                    operator: NodeSelectorOperator::In,
                    values: vec![node_name.to_string()],
                }],
            }],
        }
    }

    pub fn matches(&self, node: &NodeInfo) -> bool {
        self.node_selector_terms.iter().any(|t| t.matches(node))
    }

    /// Intersection of two single-term selectors.
    ///
    /// Multi-term selectors are combined by pairing every term of one side
    /// with every term of the other.
    pub fn intersect(&self, other: &NodeSelector) -> NodeSelector {
        let mut terms = Vec::new();
        for a in &self.node_selector_terms {
            for b in &other.node_selector_terms {
                let mut t = a.clone();
                for r in &b.match_expressions {
                    if !t.match_expressions.contains(r) {
                        t.match_expressions.push(r.clone());
                    }
                }
                for r in &b.match_fields {
                    if !t.match_fields.contains(r) {
                        t.match_fields.push(r.clone());
                    }
                }
                terms.push(t);
            }
        }
        NodeSelector {
            node_selector_terms: terms,
        }
    }

    /// Validate a selector that must use exactly one term.
    pub fn validate_single_term(&self, errs: &mut ValidationErrors, field: &str) {
        if self.node_selector_terms.len() != 1 {
            errs.invalid(
                format!("{field}.nodeSelectorTerms"),
                self.node_selector_terms.len().to_string(),
                "must have exactly one term",
            );
        }
        self.validate(errs, field);
    }

    pub fn validate(&self, errs: &mut ValidationErrors, field: &str) {
        for (i, term) in self.node_selector_terms.iter().enumerate() {
            let tf = format!("{field}.nodeSelectorTerms[{i}]");
            for (j, r) in term.match_expressions.iter().enumerate() {
                let rf = format!("{tf}.matchExpressions[{j}]");
                names::validate_label_name(errs, &format!("{rf}.key"), &r.key);
                r.validate_values(errs, &rf);
            }
            for (j, r) in term.match_fields.iter().enumerate() {
                let rf = format!("{tf}.matchFields[{j}]");
                if r.key != NODE_NAME_FIELD {
                    errs.invalid(format!("{rf}.key"), &r.key, "only metadata.name is supported");
                }
                if !matches!(r.operator, NodeSelectorOperator::In | NodeSelectorOperator::NotIn) {
                    errs.invalid(
                        format!("{rf}.operator"),
                        format!("{:?}", r.operator),
                        "matchFields supports only In and NotIn",
                    );
                }
                r.validate_values(errs, &rf);
            }
        }
    }
}

impl NodeSelectorTerm {
    /// An empty term matches nothing.
    pub fn matches(&self, node: &NodeInfo) -> bool {
        if self.match_expressions.is_empty() && self.match_fields.is_empty() {
            return false;
        }
        self.match_expressions
            .iter()
            .all(|r| r.matches(node.labels.get(&r.key).map(String::as_str)))
            && self
                .match_fields
                .iter()
                .all(|r| r.key == NODE_NAME_FIELD && r.matches(Some(node.name.as_str())))
    }
}

impl NodeSelectorRequirement {
    fn matches(&self, value: Option<&str>) -> bool {
        use NodeSelectorOperator::*;
        match self.operator {
            In => value.is_some_and(|v| self.values.iter().any(|x| x == v)),
            NotIn => !value.is_some_and(|v| self.values.iter().any(|x| x == v)),
            Exists => value.is_some(),
            DoesNotExist => value.is_none(),
            Gt | Lt => {
                let (Some(v), Some(bound)) = (value, self.values.first()) else {
                    return false;
                };
                match (v.parse::<i64>(), bound.parse::<i64>()) {
                    (Ok(v), Ok(b)) if self.operator == Gt => v > b,
                    (Ok(v), Ok(b)) => v < b,
                    _ => false,
                }
            }
        }
    }

    fn validate_values(&self, errs: &mut ValidationErrors, field: &str) {
        use NodeSelectorOperator::*;
        let vf = format!("{field}.values");
        match self.operator {
            In | NotIn if self.values.is_empty() => errs.required(vf),
            Exists | DoesNotExist if !self.values.is_empty() => {
                errs.forbidden(vf, "must be empty for Exists and DoesNotExist")
            }
            Gt | Lt => {
                if self.values.len() != 1 || self.values[0].parse::<i64>().is_err() {
                    errs.invalid(vf, self.values.join(","), "must be a single integer");
                }
            }
            _ => {}
        }
    }
}
