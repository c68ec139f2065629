//! Device allocation engine.
//!
//! Turns a claim, the device classes it references and a point-in-time
//! catalog into an allocation result. The engine is pure: it reads a
//! [`LedgerSnapshot`] and returns a [`CommitPlan`] which the caller applies
//! to the [`SharedLedger`] with a compare-and-commit.
//!
//! # Components
//!
//! - **`pool`**: groups slices into pools and decides completeness
//! - **`selector`**: device views and the injectable selector evaluator
//! - **`ledger`**: committed device and counter usage
//! - **`allocator`**: backtracking search over candidates
//! - **`binding`**: binding-condition gate read from device status
//! - **`eviction`**: `NoExecute` taint deadlines for reserved consumers

pub mod allocator;
pub mod binding;
pub mod error;
pub mod eviction;
pub mod ledger;
pub mod pool;
pub mod selector;

pub use allocator::{Allocation, AllocationTarget, Allocator};
pub use binding::{BindingGate, BindingOutcome};
pub use error::{AllocResult, AllocationError};
pub use eviction::{EvictionOrder, EvictionPlan, IntolerableTaint};
pub use ledger::{CommitPlan, CounterCharge, CounterKey, LedgerConflict, LedgerSnapshot, SharedLedger};
pub use pool::{CatalogDevice, PoolCatalog, PoolState, PoolView};
pub use selector::{BasicEvaluator, DeviceView, EvalError, EvalValue, SelectorEvaluator};
