//! Worker pool configuration.

use crate::config::ConfigService;
use crate::error::{Result, RuntimeError};
use serde::Deserialize;
use std::time::Duration;

const PREFIX: &str = "MESHESTRA_THREAD_POOL_";

/// Sizing and shutdown settings of a [`WorkerPool`](super::WorkerPool).
///
/// # Example JSON
///
/// ```json
/// {
///   "core_threads": 4,
///   "max_threads": 64,
///   "queue_size": 1000,
///   "growth_resistance": 0.5,
///   "keep_alive_time": "1m",
///   "shutdown_timeout": "30s",
///   "shutdown_interrupt": "5s",
///   "shutdown_check_interval": null
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Threads kept alive even when idle.
    /// Default: 1
    pub core_threads: usize,

    /// Upper bound on threads.
    /// Default: `max(8 * cpus, 200)`
    pub max_threads: usize,

    /// Queue capacity; `None` is unbounded.
    /// Default: unbounded
    pub queue_size: Option<usize>,

    /// Probability in `[0, 1]` that a submission is queued rather than
    /// growing the pool past its core size. `0` always grows, `1` grows only
    /// when the queue is full.
    /// Default: 0
    pub growth_resistance: f32,

    /// Idle time after which a non-core thread exits.
    /// Default: 30s
    #[serde(with = "humantime_serde")]
    pub keep_alive_time: Duration,

    /// Hard deadline for a graceful pool shutdown.
    /// Default: 1m
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Delay after which in-flight tasks are interrupted during shutdown.
    /// Default: 10s
    #[serde(with = "humantime_serde")]
    pub shutdown_interrupt: Duration,

    /// Period of the diagnostic probe during shutdown; `None` disables it.
    /// Default: 5s
    #[serde(with = "humantime_serde")]
    pub shutdown_check_interval: Option<Duration>,

    /// Start all core threads up front.
    /// Default: false
    pub prefill: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_threads: 1,
            max_threads: (8 * num_cpus::get()).max(200),
            queue_size: None,
            growth_resistance: 0.0,
            keep_alive_time: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            shutdown_interrupt: Duration::from_secs(10),
            shutdown_check_interval: Some(Duration::from_secs(5)),
            prefill: false,
        }
    }
}

impl WorkerPoolConfig {
    /// Loads `MESHESTRA_THREAD_POOL_*` keys over the defaults and validates
    /// the result.
    pub fn from_config(config: &ConfigService) -> Result<Self> {
        let key = |name: &str| format!("{}{}", PREFIX, name);
        let mut pool = Self::default();

        if let Some(core) = config.get_parsed(&key("CORE_THREADS"))? {
            pool.core_threads = core;
        }
        if let Some(max) = config.get_parsed(&key("MAX_THREADS"))? {
            pool.max_threads = max;
        }
        if let Some(queue) = config.get_parsed(&key("QUEUE_SIZE"))? {
            pool.queue_size = Some(queue);
        }
        if let Some(resistance) = config.get_parsed(&key("GROWTH_RESISTANCE"))? {
            pool.growth_resistance = resistance;
        }
        if let Some(keep_alive) = config.get_duration(&key("KEEP_ALIVE_TIME"))? {
            pool.keep_alive_time = keep_alive;
        }
        if let Some(timeout) = config.get_duration(&key("SHUTDOWN_TIMEOUT"))? {
            pool.shutdown_timeout = timeout;
        }
        if let Some(interrupt) = config.get_duration(&key("SHUTDOWN_INTERRUPT"))? {
            pool.shutdown_interrupt = interrupt;
        }
        if let Some(interval) = config.get_optional_duration(&key("SHUTDOWN_CHECK_INTERVAL"))? {
            pool.shutdown_check_interval = interval;
        }
        if let Some(prefill) = config.get_bool(&key("PREFILL"))? {
            pool.prefill = prefill;
        }

        pool.validate()?;
        Ok(pool)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(RuntimeError::invalid_config(
                format!("{}MAX_THREADS", PREFIX),
                "max_threads must be > 0",
            ));
        }
        if self.core_threads > self.max_threads {
            return Err(RuntimeError::invalid_config(
                format!("{}CORE_THREADS", PREFIX),
                format!(
                    "core_threads ({}) must not exceed max_threads ({})",
                    self.core_threads, self.max_threads
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.growth_resistance) {
            return Err(RuntimeError::invalid_config(
                format!("{}GROWTH_RESISTANCE", PREFIX),
                format!("{} is outside [0, 1]", self.growth_resistance),
            ));
        }
        if self.shutdown_check_interval == Some(Duration::ZERO) {
            return Err(RuntimeError::invalid_config(
                format!("{}SHUTDOWN_CHECK_INTERVAL", PREFIX),
                "use 'none' to disable the check instead of 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.core_threads, 1);
        assert!(config.max_threads >= 200);
        assert!(config.queue_size.is_none());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_interrupt, Duration::from_secs(10));
        assert_eq!(config.shutdown_check_interval, Some(Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let json = r#"{
            "core_threads": 2,
            "max_threads": 4,
            "queue_size": 16,
            "shutdown_timeout": "2s",
            "shutdown_interrupt": "500ms",
            "shutdown_check_interval": null
        }"#;
        let config: WorkerPoolConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.core_threads, 2);
        assert_eq!(config.queue_size, Some(16));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(config.shutdown_interrupt, Duration::from_millis(500));
        assert!(config.shutdown_check_interval.is_none());
        assert_eq!(config.keep_alive_time, Duration::from_secs(30));
    }

    #[test]
    fn test_from_config_service() {
        let service = ConfigService::empty();
        service.set("MESHESTRA_THREAD_POOL_CORE_THREADS", "3");
        service.set("MESHESTRA_THREAD_POOL_MAX_THREADS", "6");
        service.set("MESHESTRA_THREAD_POOL_GROWTH_RESISTANCE", "0.25");
        service.set("MESHESTRA_THREAD_POOL_SHUTDOWN_CHECK_INTERVAL", "none");
        service.set("MESHESTRA_THREAD_POOL_PREFILL", "on");

        let config = WorkerPoolConfig::from_config(&service).unwrap();
        assert_eq!(config.core_threads, 3);
        assert_eq!(config.max_threads, 6);
        assert_eq!(config.growth_resistance, 0.25);
        assert!(config.shutdown_check_interval.is_none());
        assert!(config.prefill);
    }

    #[test]
    fn test_validation_failures() {
        let service = ConfigService::empty();
        service.set("MESHESTRA_THREAD_POOL_CORE_THREADS", "10");
        service.set("MESHESTRA_THREAD_POOL_MAX_THREADS", "2");
        let err = WorkerPoolConfig::from_config(&service).unwrap_err();
        assert!(err.to_string().contains("CORE_THREADS"));

        let config = WorkerPoolConfig {
            growth_resistance: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WorkerPoolConfig {
            max_threads: 0,
            core_threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
