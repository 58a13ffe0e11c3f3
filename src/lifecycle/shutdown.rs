//! Process Shutdown Hooks
//!
//! Listens for OS signals and forwards them to the coordinator. Termination
//! signals run the shutdown hook and then exit the process; the quit signal
//! only produces a diagnostic dump.

use super::coordinator::{EXIT_SIGNAL_BASE, ProcessLifecycleCoordinator};
use super::{LifecycleError, Result};
use std::sync::Weak;
use std::thread;

#[cfg(unix)]
const SIGHUP: i32 = 1;
const SIGINT: i32 = 2;
#[cfg(unix)]
const SIGTERM: i32 = 15;

/// Callbacks handed to a [`SignalRegistrar`].
///
/// Holds the coordinator weakly; once it is dropped the hooks do nothing.
#[derive(Clone)]
pub struct ProcessHooks {
    coordinator: Weak<ProcessLifecycleCoordinator>,
}

impl ProcessHooks {
    pub(crate) fn new(coordinator: Weak<ProcessLifecycleCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Force shutdown and block until the current application has exited.
    pub fn shutdown(&self, signal: Option<i32>) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.on_process_shutdown(signal);
        }
    }

    pub fn dump_diagnostics(&self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.dump_diagnostics();
        }
    }
}

/// Wires OS signals to [`ProcessHooks`]. Called at most once per coordinator.
pub trait SignalRegistrar: Send + Sync {
    fn register(&self, hooks: ProcessHooks) -> Result<()>;
}

/// Registers nothing, for processes that handle signals themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistrar;

impl SignalRegistrar for NoopRegistrar {
    fn register(&self, _hooks: ProcessHooks) -> Result<()> {
        Ok(())
    }
}

/// Listens for signals on a dedicated thread driving a current-thread tokio
/// runtime.
///
/// * `SIGINT`, `SIGTERM`, `SIGHUP`: shutdown hook, then exit with `128 + signal`
/// * `SIGQUIT`: diagnostic dump, the process keeps running
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSignalRegistrar;

impl SignalRegistrar for TokioSignalRegistrar {
    fn register(&self, hooks: ProcessHooks) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| LifecycleError::SignalRegistration(e.to_string()))?;

        // streams must exist before returning so no signal slips through
        let signals = {
            let _guard = runtime.enter();
            Signals::new()?
        };

        thread::Builder::new()
            .name("meshestra-signals".to_string())
            .spawn(move || {
                let signal = runtime.block_on(signals.listen(&hooks));
                tracing::info!("Received signal {}, shutting down", signal);
                hooks.shutdown(Some(signal));
                crate::lifecycle::traits::terminate(EXIT_SIGNAL_BASE + signal);
            })
            .map_err(|e| LifecycleError::SignalRegistration(e.to_string()))?;

        tracing::debug!("Signal handlers registered");
        Ok(())
    }
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let install = |kind: SignalKind, name: &str| {
            signal(kind).map_err(|e| {
                LifecycleError::SignalRegistration(format!("Failed to install {} handler: {}", name, e))
            })
        };
        Ok(Self {
            interrupt: install(SignalKind::interrupt(), "SIGINT")?,
            terminate: install(SignalKind::terminate(), "SIGTERM")?,
            hangup: install(SignalKind::hangup(), "SIGHUP")?,
            quit: install(SignalKind::quit(), "SIGQUIT")?,
        })
    }

    /// Resolves with the number of the first termination signal.
    async fn listen(mut self, hooks: &ProcessHooks) -> i32 {
        loop {
            tokio::select! {
                _ = self.interrupt.recv() => return SIGINT,
                _ = self.terminate.recv() => return SIGTERM,
                _ = self.hangup.recv() => return SIGHUP,
                _ = self.quit.recv() => {
                    tracing::info!("Received SIGQUIT signal");
                    hooks.dump_diagnostics();
                }
            }
        }
    }
}

#[cfg(windows)]
struct Signals {
    ctrl_c: tokio::signal::windows::CtrlC,
    ctrl_break: tokio::signal::windows::CtrlBreak,
}

#[cfg(windows)]
impl Signals {
    fn new() -> Result<Self> {
        use tokio::signal::windows::{ctrl_break, ctrl_c};

        let map = |e: std::io::Error| LifecycleError::SignalRegistration(e.to_string());
        Ok(Self {
            ctrl_c: ctrl_c().map_err(map)?,
            ctrl_break: ctrl_break().map_err(map)?,
        })
    }

    async fn listen(mut self, hooks: &ProcessHooks) -> i32 {
        loop {
            tokio::select! {
                _ = self.ctrl_c.recv() => return SIGINT,
                _ = self.ctrl_break.recv() => {
                    tracing::info!("Received Ctrl+Break signal");
                    hooks.dump_diagnostics();
                }
            }
        }
    }
}
