//! Lifecycle Module
//!
//! Drives one application at a time through its start/stop state machine and
//! decides, process-wide, when shutdown happens and with which exit code.
//!
//! # Lifecycle Phases
//!
//! ```text
//! 1. ProcessLifecycleCoordinator::run
//!    ↓
//! 2. Signal handlers registered (once per process)
//!    ↓
//! 3. INITIAL → STARTING                ← Application::do_start
//!    ↓
//! 4. STARTED
//!    ↓
//! [command task runs | waiting for exit(code) or SIGINT/SIGTERM/SIGHUP]
//!    ↓
//! 5. STOPPING                          ← Application::do_stop
//!    ↓                                   (shutdown tasks, then worker pools)
//! 6. STOPPED
//!    ↓
//! 7. EXIT                              ← shutdown hook released
//!    ↓
//! 8. Exit code handler
//! ```
//!
//! # Example
//!
//! ```rust
//! use meshestra_runtime::lifecycle::{
//!     ApplicationBuilder, CommandTask, CoordinatorOptions, ExitCodeHandler, NoopRegistrar,
//!     ProcessLifecycleCoordinator,
//! };
//! use std::sync::Arc;
//!
//! let coordinator = ProcessLifecycleCoordinator::with_registrar(
//!     CoordinatorOptions::default(),
//!     Box::new(NoopRegistrar),
//! );
//! let lifecycle = ApplicationBuilder::new("migrate").build();
//!
//! let command = || -> anyhow::Result<Box<dyn CommandTask>> {
//!     Ok(Box::new(|args: &[String]| -> anyhow::Result<i32> {
//!         tracing::info!("Migrating with {:?}", args);
//!         Ok(0)
//!     }))
//! };
//! let on_exit: ExitCodeHandler = Arc::new(|code, _| assert_eq!(code, 0));
//!
//! coordinator.run(lifecycle, Some(&command), Some(on_exit), &[])?;
//! # Ok::<(), meshestra_runtime::lifecycle::LifecycleError>(())
//! ```

mod application;
mod builder;
mod coordinator;
mod error;
mod shutdown;
mod state;
mod timing;
mod traits;

pub use application::ApplicationLifecycle;
pub use builder::{ApplicationBuilder, AssembledApplication};
pub use coordinator::{
    CoordinatorOptions, EXIT_CONFIG_ERROR, EXIT_OK, EXIT_SIGNAL_BASE, EXIT_UNCLEAN_SHUTDOWN,
    ProcessLifecycleCoordinator,
};
pub use error::{LifecycleError, Result, SharedError};
pub use shutdown::{NoopRegistrar, ProcessHooks, SignalRegistrar, TokioSignalRegistrar};
pub use state::ApplicationState;
pub use traits::{
    Application, CommandTask, CommandTaskFactory, DiagnosticDump, ExitCodeHandler,
    default_exit_code_handler,
};
