//! Application Assembly
//!
//! Turns a list of bootstrap steps and worker pools into an [`Application`],
//! so callers that do not need a hand-written implementation get the
//! start/stop contract for free.

use super::{Application, ApplicationLifecycle};
use crate::context::ShutdownTaskRegistry;
use crate::worker::WorkerPool;
use anyhow::Context;
use std::sync::Arc;

type BootstrapStep = Box<dyn Fn(&ShutdownTaskRegistry) -> anyhow::Result<()> + Send + Sync>;

/// Builder for assembled applications
///
/// # Example
///
/// ```rust
/// use meshestra_runtime::context::{ShutdownAction, ShutdownContext};
/// use meshestra_runtime::lifecycle::ApplicationBuilder;
///
/// let lifecycle = ApplicationBuilder::new("orders")
///     .step("database", |context| {
///         // open connections...
///         context.add_shutdown_task(10, ShutdownAction::named("database", || Ok(())));
///         Ok(())
///     })
///     .build();
///
/// lifecycle.start(&[])?;
/// lifecycle.close()?;
/// # Ok::<(), meshestra_runtime::lifecycle::LifecycleError>(())
/// ```
pub struct ApplicationBuilder {
    name: String,
    steps: Vec<(String, BootstrapStep)>,
    pools: Vec<WorkerPool>,
}

impl ApplicationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            pools: Vec::new(),
        }
    }

    /// Add a bootstrap step. Steps run in the order they were added.
    pub fn step<F>(mut self, name: impl Into<String>, step: F) -> Self
    where
        F: Fn(&ShutdownTaskRegistry) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.steps.push((name.into(), Box::new(step)));
        self
    }

    /// Release `pool` after every other shutdown task of the application.
    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn build_application(self) -> AssembledApplication {
        AssembledApplication {
            steps: self.steps,
            pools: self.pools,
            registry: Arc::new(ShutdownTaskRegistry::new()),
        }
    }

    /// Build the application and wrap it in a fresh lifecycle.
    pub fn build(self) -> Arc<ApplicationLifecycle> {
        let name = self.name.clone();
        ApplicationLifecycle::new(name, Arc::new(self.build_application()))
    }
}

/// An [`Application`] made of bootstrap steps
///
/// `do_start` records the command line, registers every worker pool for
/// release and runs the steps; the first failing step aborts the start.
/// `do_stop` drains the registry.
pub struct AssembledApplication {
    steps: Vec<(String, BootstrapStep)>,
    pools: Vec<WorkerPool>,
    registry: Arc<ShutdownTaskRegistry>,
}

impl AssembledApplication {
    pub fn shutdown_context(&self) -> &Arc<ShutdownTaskRegistry> {
        &self.registry
    }
}

impl Application for AssembledApplication {
    fn do_start(&self, args: &[String]) -> anyhow::Result<()> {
        self.registry.set_command_line_args(args);
        // registered first so a failing step still releases the pools
        for pool in &self.pools {
            pool.register_shutdown(self.registry.as_ref());
        }
        for (name, step) in &self.steps {
            tracing::debug!("Running bootstrap step {}", name);
            step(self.registry.as_ref()).with_context(|| format!("bootstrap step '{}' failed", name))?;
        }
        Ok(())
    }

    fn do_stop(&self) -> anyhow::Result<()> {
        self.registry.drain();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ShutdownAction, ShutdownContext};
    use crate::lifecycle::ApplicationState;
    use crate::worker::WorkerPoolConfig;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_steps_run_in_order_and_see_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let second = Arc::clone(&seen);

        let lifecycle = ApplicationBuilder::new("ordered")
            .step("first", move |context| {
                first.lock().unwrap().push(context.command_line_args().join(" "));
                Ok(())
            })
            .step("second", move |_| {
                second.lock().unwrap().push("second".to_string());
                Ok(())
            })
            .build();

        lifecycle
            .start(&["--port".to_string(), "8080".to_string()])
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["--port 8080", "second"]);
        lifecycle.close().unwrap();
        assert_eq!(lifecycle.state(), ApplicationState::Exit);
    }

    #[test]
    fn test_stop_drains_registered_tasks_before_pool_release() {
        let pool = WorkerPool::new(
            "assembled",
            WorkerPoolConfig {
                core_threads: 1,
                max_threads: 1,
                shutdown_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        )
        .unwrap();
        let observed = Arc::new(Mutex::new(None));

        let task_pool = pool.clone();
        let sink = Arc::clone(&observed);
        let lifecycle = ApplicationBuilder::new("with-pool")
            .worker_pool(pool.clone())
            .step("cleanup", move |context| {
                let task_pool = task_pool.clone();
                let sink = Arc::clone(&sink);
                context.add_shutdown_task(
                    0,
                    ShutdownAction::new(move || {
                        *sink.lock().unwrap() = Some(task_pool.is_shutdown());
                        Ok(())
                    }),
                );
                Ok(())
            })
            .build();

        lifecycle.start(&[]).unwrap();
        lifecycle.stop().unwrap();

        assert_eq!(*observed.lock().unwrap(), Some(false));
        assert!(pool.is_terminated());
    }

    #[test]
    fn test_failing_step_names_the_step() {
        let lifecycle = ApplicationBuilder::new("broken")
            .step("config", |_| anyhow::bail!("missing key"))
            .build();

        let err = lifecycle.start(&[]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bootstrap step 'config' failed"));
        assert!(message.contains("missing key"));
    }
}
