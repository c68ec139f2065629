//! dra-controller — claim lifecycle orchestration.
//!
//! Ties the object store, the allocation engine and the shared counter
//! ledger together:
//!
//! ```text
//! ClaimController
//!   ├── StateStore (read slices/classes/claims, CAS claim status)
//!   ├── Allocator (pure decision against a ledger snapshot)
//!   ├── SharedLedger (compare-and-commit of devices and counters)
//!   ├── AllocationMetrics (counters labelled by a registered identifier)
//!   └── per-claim async mutex (one transition in flight per claim)
//! ```

pub mod controller;
pub mod error;

pub use controller::{ClaimController, EvictionSweep, SweepFailure, epoch_secs};
pub use error::{ControllerError, ControllerResult};
