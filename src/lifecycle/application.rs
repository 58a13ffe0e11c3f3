//! The per-application start/stop state machine
//!
//! Any number of threads may race to start or stop the same lifecycle. The
//! first caller of each transition does the work outside the lock; everyone
//! else waits on the condition variable until that transition settles.

use super::coordinator::ProcessLifecycleCoordinator;
use super::timing::Timing;
use super::{Application, ApplicationState, LifecycleError, Result, SharedError};
use crate::error::panic_error;
use crate::interrupt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

struct LifecycleInner {
    state: ApplicationState,
    start_error: Option<SharedError>,
    failure_cleaned_up: bool,
    timing: Timing,
}

struct Shared {
    inner: Mutex<LifecycleInner>,
    state_changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One run of an application through
/// `INITIAL → STARTING → STARTED → STOPPING → STOPPED → EXIT`.
///
/// # Example
///
/// ```rust,no_run
/// use meshestra_runtime::lifecycle::{Application, ApplicationLifecycle};
/// use std::sync::Arc;
///
/// # struct Server;
/// # impl Application for Server {
/// #     fn do_start(&self, _: &[String]) -> anyhow::Result<()> { Ok(()) }
/// #     fn do_stop(&self) -> anyhow::Result<()> { Ok(()) }
/// # }
/// let lifecycle = ApplicationLifecycle::new("server", Arc::new(Server));
/// lifecycle.start(&[])?;
/// // ... serve ...
/// lifecycle.stop()?;
/// # Ok::<(), meshestra_runtime::lifecycle::LifecycleError>(())
/// ```
pub struct ApplicationLifecycle {
    name: String,
    application: Arc<dyn Application>,
    shared: Arc<Shared>,
    coordinator: Mutex<Weak<ProcessLifecycleCoordinator>>,
}

impl ApplicationLifecycle {
    pub fn new(name: impl Into<String>, application: Arc<dyn Application>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            application,
            shared: Arc::new(Shared {
                inner: Mutex::new(LifecycleInner {
                    state: ApplicationState::Initial,
                    start_error: None,
                    failure_cleaned_up: false,
                    timing: Timing::default(),
                }),
                state_changed: Condvar::new(),
            }),
            coordinator: Mutex::new(Weak::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ApplicationState {
        self.shared.lock().state
    }

    pub fn is_started(&self) -> bool {
        self.state() == ApplicationState::Started
    }

    /// Start the application, or wait for a concurrent start to settle.
    ///
    /// Exactly one caller runs [`Application::do_start`]. Callers racing it
    /// return `Ok` once it succeeds, or the same [`LifecycleError::StartFailed`]
    /// when it fails. A failed start leaves the lifecycle `STOPPED`.
    ///
    /// # Errors
    ///
    /// * [`LifecycleError::IllegalState`] if the lifecycle is stopping or stopped
    /// * [`LifecycleError::Interrupted`] if the caller was interrupted while
    ///   waiting; its interrupt flag stays set
    pub fn start(&self, args: &[String]) -> Result<()> {
        let _wake = self.wake_on_interrupt();
        {
            let mut inner = self.shared.lock();
            loop {
                match inner.state {
                    ApplicationState::Initial => {
                        inner.state = ApplicationState::Starting;
                        inner.timing.mark_start();
                        break;
                    }
                    ApplicationState::Starting => {
                        inner = self.await_transition(inner, "starting")?;
                    }
                    ApplicationState::Started => return Ok(()),
                    state => {
                        if let Some(cause) = &inner.start_error {
                            return Err(LifecycleError::StartFailed {
                                name: self.name.clone(),
                                cause: Arc::clone(cause),
                            });
                        }
                        return Err(LifecycleError::illegal_state(
                            &self.name,
                            state,
                            "The application is stopping or has been stopped",
                        ));
                    }
                }
            }
        }

        tracing::debug!("Starting {}", self.name);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.application.do_start(args)))
            .unwrap_or_else(|payload| Err(panic_error(payload)));

        let mut inner = self.shared.lock();
        match outcome {
            Ok(()) => {
                inner.state = ApplicationState::Started;
                inner.timing.mark_started(&self.name);
                self.shared.state_changed.notify_all();
                Ok(())
            }
            Err(e) => {
                let cause: SharedError = Arc::new(e);
                inner.state = ApplicationState::Stopped;
                inner.start_error = Some(Arc::clone(&cause));
                self.shared.state_changed.notify_all();
                Err(LifecycleError::StartFailed {
                    name: self.name.clone(),
                    cause,
                })
            }
        }
    }

    /// Stop the application, or wait for a concurrent transition to settle.
    ///
    /// Exactly one caller runs [`Application::do_stop`]; an error it raises is
    /// logged and the lifecycle still ends up `STOPPED`. Stopping an already
    /// stopped lifecycle is a no-op.
    ///
    /// # Errors
    ///
    /// * [`LifecycleError::IllegalState`] if the lifecycle was never started
    /// * [`LifecycleError::Interrupted`] if the caller was interrupted while
    ///   waiting; its interrupt flag stays set
    pub fn stop(&self) -> Result<()> {
        let _wake = self.wake_on_interrupt();
        {
            let mut inner = self.shared.lock();
            loop {
                match inner.state {
                    ApplicationState::Initial => {
                        return Err(LifecycleError::illegal_state(
                            &self.name,
                            ApplicationState::Initial,
                            "The application has not been started",
                        ));
                    }
                    ApplicationState::Starting | ApplicationState::Stopping => {
                        inner = self.await_transition(inner, "a state transition")?;
                    }
                    ApplicationState::Started => {
                        inner.state = ApplicationState::Stopping;
                        inner.timing.mark_stop();
                        break;
                    }
                    ApplicationState::Stopped | ApplicationState::Exit => return Ok(()),
                }
            }
        }

        tracing::info!("Stopping {}", self.name);
        self.run_do_stop();
        self.release_from_coordinator();

        let mut inner = self.shared.lock();
        inner.state = ApplicationState::Stopped;
        inner.timing.print_stop_time(&self.name);
        self.shared.state_changed.notify_all();
        Ok(())
    }

    /// Stop the application if needed, then move it to `EXIT`.
    pub fn close(&self) -> Result<()> {
        if self.state() != ApplicationState::Initial {
            self.stop()?;
        }
        self.mark_exited();
        Ok(())
    }

    /// Block until the lifecycle reaches `EXIT`. Interrupts are ignored.
    pub fn await_exit(&self) {
        let mut inner = self.shared.lock();
        while inner.state != ApplicationState::Exit {
            inner = self
                .shared
                .state_changed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Moves a stopped lifecycle to `EXIT` and wakes everyone waiting for it.
    ///
    /// Returns `false` if the lifecycle is not stopped yet.
    pub(crate) fn mark_exited(&self) -> bool {
        let mut inner = self.shared.lock();
        match inner.state {
            ApplicationState::Stopped => {
                inner.state = ApplicationState::Exit;
                self.shared.state_changed.notify_all();
                true
            }
            ApplicationState::Exit => true,
            _ => false,
        }
    }

    /// Best-effort teardown after a failed start.
    ///
    /// A failed `do_start` may already have registered cleanup work, so
    /// `do_stop` still runs once before the lifecycle moves to `EXIT`.
    pub(crate) fn cleanup_failed_start(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.state != ApplicationState::Stopped
                || inner.start_error.is_none()
                || inner.failure_cleaned_up
            {
                return;
            }
            inner.failure_cleaned_up = true;
            inner.timing.mark_stop();
        }
        self.run_do_stop();
        self.release_from_coordinator();
        {
            let inner = self.shared.lock();
            inner.timing.print_stop_time(&self.name);
        }
        self.mark_exited();
    }

    pub(crate) fn attach(&self, coordinator: Weak<ProcessLifecycleCoordinator>) {
        *self
            .coordinator
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = coordinator;
    }

    pub(crate) fn started_in(&self) -> Option<std::time::Duration> {
        self.shared.lock().timing.started_in()
    }

    fn run_do_stop(&self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.application.do_stop()))
            .unwrap_or_else(|payload| Err(panic_error(payload)));
        if let Err(e) = outcome {
            tracing::error!("Error stopping {}: {:#}", self.name, e);
        }
    }

    fn release_from_coordinator(&self) {
        let coordinator = self
            .coordinator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade();
        if let Some(coordinator) = coordinator {
            coordinator.release(self);
        }
    }

    fn wake_on_interrupt(&self) -> interrupt::WakerGuard {
        let shared = Arc::clone(&self.shared);
        interrupt::on_interrupt(move || {
            let _inner = shared.lock();
            shared.state_changed.notify_all();
        })
    }

    fn await_transition<'a>(
        &self,
        inner: MutexGuard<'a, LifecycleInner>,
        phase: &'static str,
    ) -> Result<MutexGuard<'a, LifecycleInner>> {
        // the interrupt flag is left set for the caller to observe
        if interrupt::is_interrupted() {
            return Err(LifecycleError::interrupted(&self.name, phase));
        }
        let inner = self
            .shared
            .state_changed
            .wait(inner)
            .unwrap_or_else(PoisonError::into_inner);
        if interrupt::is_interrupted() {
            return Err(LifecycleError::interrupted(&self.name, phase));
        }
        Ok(inner)
    }
}

impl std::fmt::Debug for ApplicationLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationLifecycle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
