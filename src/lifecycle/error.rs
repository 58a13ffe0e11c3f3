//! Lifecycle-specific error types

use super::ApplicationState;
use std::sync::Arc;
use thiserror::Error;

/// A collaborator failure shared by every caller that observes it.
pub type SharedError = Arc<anyhow::Error>;

/// Errors that can occur during lifecycle operations
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    /// The requested transition is not allowed from the current state
    #[error("Illegal state for application {name} ({state}): {message}")]
    IllegalState {
        /// Name of the application
        name: String,
        /// State observed when the transition was attempted
        state: ApplicationState,
        /// Additional error message
        message: String,
    },

    /// The calling thread was interrupted while waiting on another thread's transition
    #[error("Interrupted while waiting for application {name} to finish {phase}")]
    Interrupted {
        /// Name of the application
        name: String,
        /// The transition being waited on
        phase: &'static str,
    },

    /// The bootstrap callback failed; the lifecycle is stopped for good
    #[error("Application {name} failed to start: {cause:#}")]
    StartFailed {
        /// Name of the application
        name: String,
        /// The error raised by the bootstrap callback
        cause: SharedError,
    },

    /// A command-mode task failed or could not be created
    #[error("Command task failed: {0:#}")]
    CommandFailed(SharedError),

    /// Another application is already active in this process
    #[error("Application {0} is already running")]
    AlreadyRunning(String),

    /// A caller passed an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// OS signal handlers could not be installed
    #[error("Failed to register signal handlers: {0}")]
    SignalRegistration(String),
}

impl LifecycleError {
    /// Create an illegal state error
    pub fn illegal_state(
        name: impl Into<String>,
        state: ApplicationState,
        message: impl Into<String>,
    ) -> Self {
        Self::IllegalState {
            name: name.into(),
            state,
            message: message.into(),
        }
    }

    /// Create an interrupted-while-waiting error
    pub fn interrupted(name: impl Into<String>, phase: &'static str) -> Self {
        Self::Interrupted {
            name: name.into(),
            phase,
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Whether this error was caused by an interrupt rather than a failure
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// A specialized Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;
