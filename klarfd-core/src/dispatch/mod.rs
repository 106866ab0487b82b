//! Hand-off between scanners and the worker pool.

pub mod pool;
pub mod queue;

pub use pool::{JobRunner, PoolConfig, PoolStatsSnapshot, WorkerPool};
pub use queue::{DispatchItem, DispatchQueue, SubmitError};
