//! Collaborator contracts
//!
//! The lifecycle core never knows what an application actually does. It
//! drives these callbacks, supplied by whoever assembles the application.

use std::io::Write;
use std::sync::Arc;

/// The assembled application behind a lifecycle
///
/// `do_start` runs at most once per lifecycle. `do_stop` is expected to drain
/// the application's [`ShutdownTaskRegistry`](crate::context::ShutdownTaskRegistry),
/// which in turn releases any worker pool registered with it.
///
/// # Example
///
/// ```rust
/// use meshestra_runtime::context::{ShutdownAction, ShutdownContext, ShutdownTaskRegistry};
/// use meshestra_runtime::lifecycle::Application;
///
/// struct Server {
///     shutdown: ShutdownTaskRegistry,
/// }
///
/// impl Application for Server {
///     fn do_start(&self, _args: &[String]) -> anyhow::Result<()> {
///         self.shutdown.add_shutdown_task(10, ShutdownAction::new(|| {
///             tracing::info!("Closing listener");
///             Ok(())
///         }));
///         Ok(())
///     }
///
///     fn do_stop(&self) -> anyhow::Result<()> {
///         self.shutdown.drain();
///         Ok(())
///     }
/// }
/// ```
pub trait Application: Send + Sync {
    /// Bring the application up. An error makes the lifecycle terminal.
    fn do_start(&self, args: &[String]) -> anyhow::Result<()>;

    /// Tear the application down. Errors are logged, never propagated.
    fn do_stop(&self) -> anyhow::Result<()>;
}

/// A bounded unit of work for command-mode runs
///
/// The returned value is a candidate process exit code.
pub trait CommandTask: Send {
    fn run(&mut self, args: &[String]) -> anyhow::Result<i32>;
}

impl<F> CommandTask for F
where
    F: FnMut(&[String]) -> anyhow::Result<i32> + Send,
{
    fn run(&mut self, args: &[String]) -> anyhow::Result<i32> {
        self(args)
    }
}

/// Resolves the command task once the application has started, so the task
/// may depend on anything the bootstrap produced.
pub trait CommandTaskFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn CommandTask>>;
}

impl<F> CommandTaskFactory for F
where
    F: Fn() -> anyhow::Result<Box<dyn CommandTask>> + Send + Sync,
{
    fn create(&self) -> anyhow::Result<Box<dyn CommandTask>> {
        self()
    }
}

/// Receives the final exit code, plus the failure when the run ended in one.
pub type ExitCodeHandler = Arc<dyn Fn(i32, Option<&anyhow::Error>) + Send + Sync>;

/// Invoked on the quit signal instead of terminating.
pub type DiagnosticDump = Arc<dyn Fn() + Send + Sync>;

/// The default exit code handler: flush output and terminate the process.
pub fn default_exit_code_handler() -> ExitCodeHandler {
    Arc::new(|code, _| terminate(code))
}

pub(crate) fn terminate(code: i32) -> ! {
    crate::worker::mark_terminating_call();
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::exit(code)
}
