//! Background worker pool for Scribe
//!
//! A fixed set of workers drains a bounded queue. Submission never blocks: when
//! the queue is full or the pool is shutting down the task is dropped with a
//! warning. Each task runs under its own timeout with a cancellation token, and
//! its failures are logged rather than propagated.

mod pool;
mod stats;

pub use pool::{PoolConfig, SubmitOutcome, TaskContext, WorkerPool, DEFAULT_QUEUE_CAPACITY};
pub use stats::PoolStats;
