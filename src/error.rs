use crate::lifecycle::LifecycleError;
use std::any::Any;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig { key: String, message: String },

    #[error("Task rejected by worker pool {pool}: {reason}")]
    Rejected { pool: String, reason: String },

    #[error("Worker task did not produce a result: {0}")]
    TaskAbandoned(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl RuntimeError {
    pub fn invalid_config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn rejected(pool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            pool: pool.into(),
            reason: reason.into(),
        }
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Converts a caught panic into an error so it can flow through the same
/// reporting paths as ordinary failures.
pub(crate) fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref()))
}
