//! redb table definitions for the object store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized objects).
//! Namespaced objects are keyed by `{namespace}/{name}`, cluster-scoped ones
//! by `{name}`.

use redb::TableDefinition;

/// Slices keyed by `{name}`.
pub const SLICES: TableDefinition<&str, &[u8]> = TableDefinition::new("slices");

/// Claims keyed by `{namespace}/{name}`.
pub const CLAIMS: TableDefinition<&str, &[u8]> = TableDefinition::new("claims");

/// Device classes keyed by `{name}`.
pub const CLASSES: TableDefinition<&str, &[u8]> = TableDefinition::new("classes");

/// Claim templates keyed by `{namespace}/{name}`.
pub const TEMPLATES: TableDefinition<&str, &[u8]> = TableDefinition::new("claim_templates");
