use crate::error::{Result, RuntimeError};
use dashmap::DashMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Toggle that disables signal handler registration entirely.
pub const DISABLE_SIGNAL_HANDLERS: &str = "MESHESTRA_DISABLE_SIGNAL_HANDLERS";

/// Configuration service
///
/// A flat key/value store, seeded from the process environment by
/// [`ConfigService::new`]. Typed getters return `Ok(None)` for absent keys and
/// an [`RuntimeError::InvalidConfig`] for values that do not parse.
#[derive(Clone, Default)]
pub struct ConfigService {
    config: Arc<DashMap<String, String>>,
}

impl ConfigService {
    pub fn new() -> Self {
        let service = Self::default();
        for (key, value) in env::vars() {
            service.set(&key, &value);
        }
        service
    }

    /// A service with no entries, independent of the environment.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.config.get(key).map(|v| v.clone())
    }

    pub fn set(&self, key: &str, value: &str) {
        self.config.insert(key.to_string(), value.to_string());
    }

    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| RuntimeError::invalid_config(key, format!("'{}': {}", raw, e)))
            })
            .transpose()
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.get(key)
            .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(RuntimeError::invalid_config(
                    key,
                    format!("'{}' is not a boolean", raw),
                )),
            })
            .transpose()
    }

    /// Reads a duration in humantime syntax (`250ms`, `30s`, `1m`).
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>> {
        self.get(key)
            .map(|raw| parse_duration(key, &raw))
            .transpose()
    }

    /// Like [`get_duration`](Self::get_duration), but an empty value or
    /// `none` explicitly disables the setting: `Ok(Some(None))`.
    pub fn get_optional_duration(&self, key: &str) -> Result<Option<Option<Duration>>> {
        self.get(key)
            .map(|raw| {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
                    Ok(None)
                } else {
                    parse_duration(key, trimmed).map(Some)
                }
            })
            .transpose()
    }
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| RuntimeError::invalid_config(key, format!("'{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let config = ConfigService::empty();
        config.set("THREADS", " 16 ");
        config.set("FLAG", "Yes");
        config.set("TIMEOUT", "1m 30s");

        assert_eq!(config.get_parsed::<usize>("THREADS").unwrap(), Some(16));
        assert_eq!(config.get_bool("FLAG").unwrap(), Some(true));
        assert_eq!(
            config.get_duration("TIMEOUT").unwrap(),
            Some(Duration::from_secs(90))
        );
        assert_eq!(config.get_parsed::<usize>("MISSING").unwrap(), None);
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let config = ConfigService::empty();
        config.set("THREADS", "many");
        config.set("FLAG", "maybe");

        let err = config.get_parsed::<usize>("THREADS").unwrap_err();
        assert!(err.to_string().contains("THREADS"));
        assert!(config.get_bool("FLAG").is_err());
    }

    #[test]
    fn test_optional_duration_can_be_disabled() {
        let config = ConfigService::empty();
        config.set("EMPTY", "");
        config.set("NONE", "None");
        config.set("SET", "5s");

        assert_eq!(config.get_optional_duration("EMPTY").unwrap(), Some(None));
        assert_eq!(config.get_optional_duration("NONE").unwrap(), Some(None));
        assert_eq!(
            config.get_optional_duration("SET").unwrap(),
            Some(Some(Duration::from_secs(5)))
        );
        assert_eq!(config.get_optional_duration("ABSENT").unwrap(), None);
    }
}
