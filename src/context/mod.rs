//! Shutdown Context
//!
//! Components register cleanup work here while the application starts. The
//! work runs when the application stops, highest priority first, followed by
//! everything registered for the final phase.
//!
//! # Example
//!
//! ```rust
//! use meshestra_runtime::context::{ShutdownAction, ShutdownContext, ShutdownTaskRegistry};
//!
//! let registry = ShutdownTaskRegistry::new();
//! registry.add_shutdown_task(10, ShutdownAction::named("close listener", || Ok(())));
//! registry.add_last_shutdown_task(0, ShutdownAction::new(|| {
//!     tracing::info!("Flushing logs");
//!     Ok(())
//! }));
//!
//! // later, from Application::do_stop
//! registry.drain();
//! ```

mod registry;

pub use registry::ShutdownTaskRegistry;

use crate::lifecycle::LifecycleError;

/// Priority used when a component has no opinion.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Deferred cleanup work, run at most once.
pub struct ShutdownAction {
    name: Option<String>,
    action: Box<dyn FnOnce() -> anyhow::Result<()> + Send>,
}

impl ShutdownAction {
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name: None,
            action: Box::new(action),
        }
    }

    /// An action whose name shows up in shutdown logs.
    pub fn named<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name: Some(name.into()),
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn run(self) -> anyhow::Result<()> {
        (self.action)()
    }
}

impl std::fmt::Debug for ShutdownAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownAction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Registration surface for shutdown work.
///
/// Larger priorities run earlier. Actions with equal priority run in the
/// order they were added. "Last" actions run only after every regular action
/// has finished.
pub trait ShutdownContext: Send + Sync {
    fn add_shutdown_task(&self, priority: i32, action: ShutdownAction);

    fn add_last_shutdown_task(&self, priority: i32, action: ShutdownAction);

    /// Like [`add_shutdown_task`](Self::add_shutdown_task), for callers that
    /// may not have an action at all.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::InvalidArgument`] when `action` is `None`.
    fn try_add_shutdown_task(
        &self,
        priority: i32,
        action: Option<ShutdownAction>,
    ) -> Result<(), LifecycleError> {
        let action = action.ok_or_else(|| LifecycleError::invalid_argument("shutdown action is missing"))?;
        self.add_shutdown_task(priority, action);
        Ok(())
    }

    fn try_add_last_shutdown_task(
        &self,
        priority: i32,
        action: Option<ShutdownAction>,
    ) -> Result<(), LifecycleError> {
        let action = action.ok_or_else(|| LifecycleError::invalid_argument("shutdown action is missing"))?;
        self.add_last_shutdown_task(priority, action);
        Ok(())
    }
}
