//! Coordination primitives over the shared queue table.
//!
//! Nothing here holds an in-process lock across records: every claim,
//! recovery and promotion is a conditional update in the store, so any number
//! of processors may share one store.

pub mod lock;
pub mod promote;
pub mod reclaim;

pub use lock::LockManager;
pub use promote::{promote_due, promote_retryable};
pub use reclaim::reclaim_stale;
