//! Worker Pool Module
//!
//! A bounded pool of OS threads for blocking and CPU-bound work, plus the
//! controller that shuts it down in escalating steps.
//!
//! # Example
//!
//! ```rust,no_run
//! use meshestra_runtime::context::ShutdownTaskRegistry;
//! use meshestra_runtime::worker::{WorkerPool, WorkerPoolConfig};
//!
//! # async fn run() -> meshestra_runtime::Result<()> {
//! let pool = WorkerPool::new("blocking", WorkerPoolConfig::default())?;
//! let registry = ShutdownTaskRegistry::new();
//! pool.register_shutdown(&registry);
//!
//! let digest = pool.execute(|| expensive_hash(b"payload")).await?;
//! # let _ = digest;
//! # Ok(())
//! # }
//! # fn expensive_hash(_: &[u8]) -> u64 { 0 }
//! ```

mod config;
mod pool;
mod shutdown;

pub use config::WorkerPoolConfig;
pub use pool::{Job, PoolSnapshot, WorkerPool, WorkerSnapshot, mark_terminating_call};
pub use shutdown::{
    ShutdownOutcome, StallDetector, TerminatingCallDetector, WorkerPoolShutdownController,
};
