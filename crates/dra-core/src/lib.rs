//! dra-core — data model for dynamic resource allocation.
//!
//! The supply side (pools, slices, devices, counters) lives in [`catalog`],
//! the demand side (requests, selectors, constraints, tolerations) in
//! [`claim`], named presets in [`class`] and the mutable claim status
//! (allocation results, reservations, per-device status) in [`status`].
//!
//! Every object exposes a `validate()` that enforces the schema rules:
//! exactly-one field groups, size ceilings and identifier formats. Invalid
//! objects are rejected at write time and never stored.

pub mod catalog;
pub mod claim;
pub mod class;
pub mod config;
pub mod error;
pub mod meta;
pub mod names;
pub mod node_selector;
pub mod quantity;
pub mod status;

pub use catalog::*;
pub use claim::*;
pub use class::*;
pub use config::DraConfig;
pub use error::{OneOfError, ValidationError, ValidationErrors, ValidationResult};
pub use meta::ObjectMeta;
pub use node_selector::{NodeInfo, NodeSelector, NodeSelectorOperator, NodeSelectorRequirement, NodeSelectorTerm};
pub use quantity::Quantity;
pub use status::*;
