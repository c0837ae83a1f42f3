//! Worker loops, backoff and the parallelism gate.

pub mod backoff;
pub mod parallel;
pub mod pool;
pub mod worker;

pub use backoff::{BackoffStrategy, DefaultBackoffStrategy};
pub use parallel::{ParallelOperation, ParallelOperations};
pub use pool::Workers;
pub use worker::{Worker, WorkerContext};
