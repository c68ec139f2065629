//! Observability for the allocation controller.
//!
//! Metrics are labelled by an [`Identifier`]. Identifiers are handed out by
//! an [`IdentifierRegistry`] that the process owns and passes to whatever
//! creates named observers; only explicitly named, unique identifiers get
//! their metrics published.
//!
//! ```text
//! IdentifierRegistry ──register(name, gvr)──▶ Identifier
//!                                                 │
//! AllocationMetrics(identifier) ◀─────────────────┘
//!   ├── record_*() ← called by the controller
//!   └── snapshot() → render_prometheus()
//! ```

pub mod collector;
pub mod error;
pub mod prometheus;
pub mod registry;

pub use collector::{AllocationMetrics, AllocationSnapshot};
pub use error::IdentifierError;
pub use prometheus::render_prometheus;
pub use registry::{GroupVersionResource, Identifier, IdentifierRegistry};
