//! dra-store — embedded object store for dynamic resource allocation.
//!
//! Backed by [redb](https://docs.rs/redb), holds the published slices,
//! claims, device classes and claim templates.
//!
//! # Architecture
//!
//! Objects are validated on write and JSON-serialized into redb's `&[u8]`
//! value columns. Every write bumps `metadata.resourceVersion`; claim status
//! updates are compare-and-swap on that version so concurrent writers detect
//! a stale base and retry with a fresh read.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod filter;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use filter::SliceFilter;
pub use store::StateStore;
