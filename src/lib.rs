//! # Meshestra Runtime
//!
//! Application lifecycle and graceful shutdown orchestration for Rust services.
//!
//! One process runs one application at a time. The runtime starts it, waits for
//! a reason to stop (a finished command, an explicit `exit(code)`, or an OS
//! signal), then tears it down in a well-defined order and reports an exit code.
//!
//! ## Features
//!
//! - **Race-free start/stop**: any number of threads may start or stop the same
//!   application; exactly one does the work, everyone else observes the outcome
//! - **First exit code wins**: explicit exits, command results and signals all
//!   compete for the exit code under one lock
//! - **Prioritized shutdown tasks**: cleanup work registered during startup runs
//!   highest priority first, with a final phase for shared resources
//! - **Escalating pool shutdown**: worker pools are drained, then interrupted,
//!   then forcibly cancelled, with periodic diagnostics in between
//! - **Cooperative interruption**: blocking waits and pool tasks can be woken
//!   with [`interrupt::InterruptHandle`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshestra_runtime::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ConfigService::new();
//!     let pool = WorkerPool::from_config("blocking", &config)?;
//!
//!     let lifecycle = ApplicationBuilder::new("orders")
//!         .worker_pool(pool.clone())
//!         .step("listener", move |context| {
//!             let pool = pool.clone();
//!             pool.submit(|| tracing::info!("Warming caches"))?;
//!             context.add_shutdown_task(
//!                 10,
//!                 ShutdownAction::named("listener", || {
//!                     tracing::info!("Closing listener");
//!                     Ok(())
//!                 }),
//!             );
//!             Ok(())
//!         })
//!         .build();
//!
//!     let coordinator = ProcessLifecycleCoordinator::new(CoordinatorOptions::from_config(&config)?);
//!     let args: Vec<String> = std::env::args().skip(1).collect();
//!
//!     // blocks until SIGINT/SIGTERM/SIGHUP or coordinator.exit(code)
//!     coordinator.run(lifecycle, None, None, &args)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod interrupt;
pub mod lifecycle;
pub mod worker;

// Re-export core types
pub use config::ConfigService;
pub use context::{ShutdownAction, ShutdownContext, ShutdownTaskRegistry};
pub use error::{Result, RuntimeError};
pub use lifecycle::{
    Application, ApplicationLifecycle, ApplicationState, LifecycleError,
    ProcessLifecycleCoordinator,
};
pub use worker::{WorkerPool, WorkerPoolConfig};

/// Prelude module for convenient imports
///
/// ```
/// use meshestra_runtime::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::ConfigService;
    pub use crate::context::{DEFAULT_PRIORITY, ShutdownAction, ShutdownContext, ShutdownTaskRegistry};
    pub use crate::error::{Result, RuntimeError};
    pub use crate::interrupt::{self, InterruptHandle, Interrupted};
    pub use crate::lifecycle::{
        Application, ApplicationBuilder, ApplicationLifecycle, ApplicationState, CommandTask,
        CommandTaskFactory, CoordinatorOptions, ExitCodeHandler, LifecycleError,
        ProcessLifecycleCoordinator,
    };
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolShutdownController};
    pub use std::sync::Arc;
}
