//! Runtime configuration resolved from environment variables.
//!
//! Resolution order for the database path:
//! 1. `KBGRAPH_PATH` (if set)
//! 2. `~/.kbgraph/kbgraph.db` (default)

use crate::db::{default_db_path, KbError};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_PATH: &str = "KBGRAPH_PATH";
pub const ENV_EVENT_CAPACITY: &str = "KBGRAPH_EVENT_CAPACITY";
pub const ENV_EVENT_HISTORY: &str = "KBGRAPH_EVENT_HISTORY";
pub const ENV_PURGE_BATCH: &str = "KBGRAPH_PURGE_BATCH";
pub const ENV_BUSY_TIMEOUT_MS: &str = "KBGRAPH_BUSY_TIMEOUT_MS";

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
pub const DEFAULT_EVENT_HISTORY: usize = 4096;
pub const DEFAULT_PURGE_BATCH: usize = 500;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Buffered events per knowledge base before slow subscribers lag.
    pub event_capacity: usize,
    /// Past events kept per knowledge base for replay after a lag.
    pub event_history: usize,
    /// Tombstoned rows removed per purge transaction.
    pub purge_batch_size: usize,
    pub busy_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("kbgraph.db"),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            event_history: DEFAULT_EVENT_HISTORY,
            purge_batch_size: DEFAULT_PURGE_BATCH,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl Config {
    /// Resolves configuration from the process environment.
    pub fn from_env() -> Result<Self, KbError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Resolves configuration from an arbitrary variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KbError> {
        let db_path = match lookup(ENV_PATH) {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => default_db_path()?,
        };

        let event_capacity = parse_positive(&lookup, ENV_EVENT_CAPACITY)?
            .unwrap_or(DEFAULT_EVENT_CAPACITY);
        let event_history = parse_positive(&lookup, ENV_EVENT_HISTORY)?
            .unwrap_or(DEFAULT_EVENT_HISTORY);
        let purge_batch_size =
            parse_positive(&lookup, ENV_PURGE_BATCH)?.unwrap_or(DEFAULT_PURGE_BATCH);
        let busy_timeout = parse_positive(&lookup, ENV_BUSY_TIMEOUT_MS)?
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(DEFAULT_BUSY_TIMEOUT);

        Ok(Self {
            db_path,
            event_capacity,
            event_history,
            purge_batch_size,
            busy_timeout,
        })
    }

    /// Same as `Config::default()` but rooted at the given database file.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<usize>, KbError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(KbError::Validation(format!(
                "{key} must be a positive integer, got '{raw}'"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_path_respects_env_var() {
        let config = Config::from_vars(vars(&[(ENV_PATH, "/tmp/custom_kb.db")]))
            .expect("config should resolve");
        assert_eq!(config.db_path, PathBuf::from("/tmp/custom_kb.db"));
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.event_history, DEFAULT_EVENT_HISTORY);
        assert_eq!(config.purge_batch_size, DEFAULT_PURGE_BATCH);
    }

    #[test]
    fn test_path_falls_back_to_default() {
        let config = Config::from_vars(vars(&[])).expect("config should resolve");
        assert!(config.db_path.to_string_lossy().contains(".kbgraph"));
        assert!(config.db_path.to_string_lossy().ends_with("kbgraph.db"));
    }

    #[test]
    fn test_numeric_overrides() {
        let config = Config::from_vars(vars(&[
            (ENV_PATH, "x.db"),
            (ENV_EVENT_CAPACITY, "16"),
            (ENV_EVENT_HISTORY, "64"),
            (ENV_PURGE_BATCH, "3"),
            (ENV_BUSY_TIMEOUT_MS, "250"),
        ]))
        .expect("config should resolve");
        assert_eq!(config.event_capacity, 16);
        assert_eq!(config.event_history, 64);
        assert_eq!(config.purge_batch_size, 3);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        for bad in ["0", "-1", "lots"] {
            let result = Config::from_vars(vars(&[(ENV_PATH, "x.db"), (ENV_PURGE_BATCH, bad)]));
            assert!(matches!(result, Err(KbError::Validation(_))), "accepted {bad}");
        }
    }
}
