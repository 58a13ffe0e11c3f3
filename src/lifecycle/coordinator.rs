//! Process Lifecycle Coordinator
//!
//! Arbitrates which application lifecycle is active in the process, collects
//! the eventual exit code and decides when shutdown has been requested.

use super::shutdown::{ProcessHooks, SignalRegistrar, TokioSignalRegistrar};
use super::traits::default_exit_code_handler;
use super::{
    ApplicationLifecycle, ApplicationState, CommandTaskFactory, DiagnosticDump, ExitCodeHandler, LifecycleError,
    Result, SharedError,
};
use crate::config::{ConfigService, DISABLE_SIGNAL_HANDLERS};
use crate::error::panic_error;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

/// Exit code indicating clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Exit code used when startup or the run loop fails.
pub const EXIT_CONFIG_ERROR: i32 = 1;
/// Exit code indicating that shutdown did not proceed cleanly.
pub const EXIT_UNCLEAN_SHUTDOWN: i32 = 3;
/// A process terminated by a signal exits with this base plus the signal number.
pub const EXIT_SIGNAL_BASE: i32 = 128;

const EXIT_CODE_UNSET: i32 = -1;

/// Options for a [`ProcessLifecycleCoordinator`]
#[derive(Clone)]
pub struct CoordinatorOptions {
    disable_signal_handlers: bool,
    exit_code_handler: ExitCodeHandler,
    diagnostic_dump: Option<DiagnosticDump>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            disable_signal_handlers: false,
            exit_code_handler: default_exit_code_handler(),
            diagnostic_dump: None,
        }
    }
}

impl CoordinatorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the signal handler toggle from configuration.
    pub fn from_config(config: &ConfigService) -> crate::Result<Self> {
        let disable = config.get_bool(DISABLE_SIGNAL_HANDLERS)?.unwrap_or(false);
        Ok(Self::default().disable_signal_handlers(disable))
    }

    /// Skip signal handler registration, for processes that own signal handling.
    pub fn disable_signal_handlers(mut self, disable: bool) -> Self {
        self.disable_signal_handlers = disable;
        self
    }

    /// Replace the handler invoked with the final exit code.
    pub fn exit_code_handler(mut self, handler: ExitCodeHandler) -> Self {
        self.exit_code_handler = handler;
        self
    }

    /// Replace the callback run on the quit signal.
    pub fn diagnostic_dump(mut self, dump: DiagnosticDump) -> Self {
        self.diagnostic_dump = Some(dump);
        self
    }
}

struct CoordinatorState {
    exit_code: i32,
    shutdown_requested: bool,
    current: Option<Weak<ApplicationLifecycle>>,
    last: Option<Weak<ApplicationLifecycle>>,
    hooks_registered: bool,
    vm_shutting_down: bool,
}

/// Owns the single active [`ApplicationLifecycle`] of the process.
///
/// Construct one at process entry and hand it to whatever owns `main`; it is
/// never re-created implicitly.
///
/// # Example
///
/// ```rust,no_run
/// use meshestra_runtime::lifecycle::{
///     ApplicationBuilder, CoordinatorOptions, ProcessLifecycleCoordinator,
/// };
///
/// fn main() -> anyhow::Result<()> {
///     let coordinator = ProcessLifecycleCoordinator::new(CoordinatorOptions::default());
///     let lifecycle = ApplicationBuilder::new("server")
///         .step("listen", |_context| Ok(()))
///         .build();
///
///     let args: Vec<String> = std::env::args().skip(1).collect();
///     // blocks until SIGINT/SIGTERM or coordinator.exit(code)
///     coordinator.run(lifecycle, None, None, &args)?;
///     Ok(())
/// }
/// ```
pub struct ProcessLifecycleCoordinator {
    state: Mutex<CoordinatorState>,
    state_changed: Condvar,
    options: CoordinatorOptions,
    registrar: Box<dyn SignalRegistrar>,
    self_ref: Weak<ProcessLifecycleCoordinator>,
}

impl ProcessLifecycleCoordinator {
    /// A coordinator listening for OS signals with tokio.
    pub fn new(options: CoordinatorOptions) -> Arc<Self> {
        Self::with_registrar(options, Box::new(TokioSignalRegistrar))
    }

    /// A coordinator with a custom signal wiring.
    pub fn with_registrar(
        options: CoordinatorOptions,
        registrar: Box<dyn SignalRegistrar>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(CoordinatorState {
                exit_code: EXIT_CODE_UNSET,
                shutdown_requested: false,
                current: None,
                last: None,
                hooks_registered: false,
                vm_shutting_down: false,
            }),
            state_changed: Condvar::new(),
            options,
            registrar,
            self_ref: self_ref.clone(),
        })
    }

    /// Run `lifecycle` until shutdown, then hand the exit code to the handler.
    ///
    /// With a `command` factory the run is bounded: the task's return value
    /// becomes a candidate exit code and shutdown follows as soon as it
    /// returns. Without one, this blocks until [`exit`](Self::exit) is called
    /// or a termination signal arrives.
    ///
    /// A lifecycle that was already started by the caller is not stopped here.
    ///
    /// # Errors
    ///
    /// * [`LifecycleError::AlreadyRunning`] if another application is active
    ///   and shutdown has not been requested
    /// * [`LifecycleError::SignalRegistration`] if signal wiring failed
    /// * [`LifecycleError::StartFailed`] / [`LifecycleError::CommandFailed`]
    ///   after cleanup ran and the exit code handler received code 1
    pub fn run(
        &self,
        lifecycle: Arc<ApplicationLifecycle>,
        command: Option<&dyn CommandTaskFactory>,
        exit_code_handler: Option<ExitCodeHandler>,
        args: &[String],
    ) -> Result<()> {
        let exit_code_handler =
            exit_code_handler.unwrap_or_else(|| Arc::clone(&self.options.exit_code_handler));
        let already_started = lifecycle.is_started();

        {
            let mut state = self.lock();
            if !state.hooks_registered {
                self.register_hooks()?;
                state.hooks_registered = true;
            }
            if let Some(current) = state.current.as_ref().and_then(Weak::upgrade) {
                if !state.shutdown_requested {
                    return Err(LifecycleError::AlreadyRunning(current.name().to_string()));
                }
            }
            state.exit_code = EXIT_CODE_UNSET;
            state.shutdown_requested = false;
            state.current = Some(Arc::downgrade(&lifecycle));
            state.last = Some(Arc::downgrade(&lifecycle));
        }
        lifecycle.attach(self.self_ref.clone());

        if let Err(e) = lifecycle.start(args) {
            tracing::error!("{}", e);
            self.request_shutdown();
            self.cleanup_failed_start(&lifecycle);
            let cause = anyhow::Error::new(e.clone());
            exit_code_handler(EXIT_CONFIG_ERROR, Some(&cause));
            return Err(e);
        }

        if let Some(factory) = command {
            let outcome = run_command(factory, args);
            {
                let mut state = self.lock();
                if let Ok(code) = outcome {
                    record_exit_code(&mut state, code);
                }
                state.shutdown_requested = true;
                self.state_changed.notify_all();
            }
            if let Err(cause) = outcome {
                tracing::error!("Error running command task: {:#}", cause);
                if !already_started {
                    if let Err(e) = lifecycle.close() {
                        tracing::error!("{}", e);
                    }
                }
                exit_code_handler(EXIT_CONFIG_ERROR, Some(cause.as_ref()));
                return Err(LifecycleError::CommandFailed(cause));
            }
        } else {
            let mut state = self.lock();
            while !state.shutdown_requested {
                state = self
                    .state_changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        if !already_started {
            if let Err(e) = lifecycle.close() {
                tracing::error!("{}", e);
                let code = match self.exit_code() {
                    EXIT_OK => EXIT_UNCLEAN_SHUTDOWN,
                    code => code,
                };
                let cause = anyhow::Error::new(e.clone());
                exit_code_handler(code, Some(&cause));
                return Err(e);
            }
        }
        exit_code_handler(self.exit_code(), None);
        Ok(())
    }

    /// Request shutdown with `code`.
    ///
    /// The first non-negative code wins; later calls cannot overwrite it. The
    /// first caller to request shutdown wakes the run loop; later calls only
    /// contribute a code if none was fixed yet.
    pub fn exit(&self, code: i32) {
        let mut state = self.lock();
        record_exit_code(&mut state, code);
        if state.shutdown_requested {
            return;
        }
        state.shutdown_requested = true;
        self.state_changed.notify_all();
    }

    /// Block until shutdown has been requested. Interrupts are ignored.
    pub fn wait_for_exit(&self) {
        let mut state = self.lock();
        while !state.shutdown_requested {
            state = self
                .state_changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// The exit code so far, `0` when none was set.
    pub fn exit_code(&self) -> i32 {
        let code = self.lock().exit_code;
        if code == EXIT_CODE_UNSET { EXIT_OK } else { code }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.lock().shutdown_requested
    }

    /// Whether the process-level shutdown hook has fired.
    pub fn is_vm_shutting_down(&self) -> bool {
        self.lock().vm_shutting_down
    }

    pub fn current_lifecycle(&self) -> Option<Arc<ApplicationLifecycle>> {
        self.lock().current.as_ref().and_then(Weak::upgrade)
    }

    /// The process shutdown hook.
    ///
    /// Forces shutdown, then blocks until the current lifecycle reaches
    /// `EXIT` so the process is not torn down mid-cleanup. A signal number
    /// becomes the candidate exit code `128 + signal`.
    pub(crate) fn on_process_shutdown(&self, signal: Option<i32>) {
        let current = {
            let mut state = self.lock();
            state.vm_shutting_down = true;
            if let Some(signal) = signal {
                record_exit_code(&mut state, EXIT_SIGNAL_BASE + signal);
            }
            state.shutdown_requested = true;
            self.state_changed.notify_all();
            // a lifecycle already released but still stopping must be awaited too
            state.current.as_ref().and_then(Weak::upgrade).or_else(|| {
                state
                    .last
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .filter(|last| !matches!(last.state(), ApplicationState::Initial | ApplicationState::Exit))
            })
        };

        if let Some(lifecycle) = current {
            tracing::debug!("Shutdown hook waiting for {} to exit", lifecycle.name());
            lifecycle.await_exit();
        }
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
    }

    pub(crate) fn dump_diagnostics(&self) {
        if let Some(dump) = &self.options.diagnostic_dump {
            dump();
            return;
        }
        let (shutdown_requested, exit_code, current) = {
            let state = self.lock();
            (
                state.shutdown_requested,
                state.exit_code,
                state.current.as_ref().and_then(Weak::upgrade),
            )
        };
        tracing::info!(
            "Diagnostic dump at {}: application={}, shutdown_requested={}, exit_code={}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            current
                .map(|lifecycle| match lifecycle.started_in() {
                    Some(took) => format!(
                        "{} ({}, started in {:.3}s)",
                        lifecycle.name(),
                        lifecycle.state(),
                        took.as_secs_f64()
                    ),
                    None => format!("{} ({})", lifecycle.name(), lifecycle.state()),
                })
                .unwrap_or_else(|| "none".to_string()),
            shutdown_requested,
            exit_code,
        );
    }

    /// Clears the current lifecycle if it is `lifecycle`.
    pub(crate) fn release(&self, lifecycle: &ApplicationLifecycle) {
        let mut state = self.lock();
        let is_current = state
            .current
            .as_ref()
            .is_some_and(|current| std::ptr::eq(current.as_ptr(), lifecycle));
        if is_current {
            state.current = None;
        }
    }

    fn register_hooks(&self) -> Result<()> {
        if self.options.disable_signal_handlers {
            tracing::debug!("Signal handler registration disabled");
            return Ok(());
        }
        self.registrar
            .register(ProcessHooks::new(self.self_ref.clone()))
    }

    fn request_shutdown(&self) {
        let mut state = self.lock();
        state.shutdown_requested = true;
        self.state_changed.notify_all();
    }

    fn cleanup_failed_start(&self, lifecycle: &Arc<ApplicationLifecycle>) {
        let target = Arc::clone(lifecycle);
        let cleanup = thread::Builder::new()
            .name("meshestra-failed-start-cleanup".to_string())
            .spawn(move || target.cleanup_failed_start());
        match cleanup {
            // joined so returning from main cannot truncate the cleanup
            Ok(handle) => {
                if handle.join().is_err() {
                    tracing::error!("Cleanup after failed start of {} panicked", lifecycle.name());
                }
            }
            Err(e) => {
                tracing::warn!("Could not spawn cleanup thread ({}), cleaning up inline", e);
                lifecycle.cleanup_failed_start();
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn record_exit_code(state: &mut CoordinatorState, code: i32) {
    if code >= 0 && state.exit_code == EXIT_CODE_UNSET {
        state.exit_code = code;
    }
}

fn run_command(factory: &dyn CommandTaskFactory, args: &[String]) -> std::result::Result<i32, SharedError> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        let mut task = factory.create()?;
        task.run(args)
    }))
    .unwrap_or_else(|payload| Err(panic_error(payload)))
    .map_err(Arc::new)
}
