use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::model::Ms;

/// Host settings, read from `DOCKET_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// How long a mutation may wait for its provider's lock. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Compact once this many events have been appended since the last compaction.
    pub compact_threshold: u64,
    /// How long after its end an unattended appointment becomes a no-show.
    /// `None` disables the sweeper.
    pub no_show_grace_ms: Option<Ms>,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            lock_timeout: None,
            compact_threshold: 1000,
            no_show_grace_ms: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing or unparseable keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("DOCKET_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: parsed(&lookup, "DOCKET_METRICS_PORT"),
            lock_timeout: parsed(&lookup, "DOCKET_LOCK_TIMEOUT_MS").map(Duration::from_millis),
            compact_threshold: parsed(&lookup, "DOCKET_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            no_show_grace_ms: parsed::<Ms>(&lookup, "DOCKET_NO_SHOW_GRACE_MS").filter(|g| *g >= 0),
            sweep_interval: parsed::<u64>(&lookup, "DOCKET_SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("docket.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config, Config::default());
        assert_eq!(config.journal_path(), PathBuf::from("./data/docket.wal"));
    }

    #[test]
    fn reads_every_key() {
        let config = Config::from_lookup(lookup_in(&[
            ("DOCKET_DATA_DIR", "/var/lib/docket"),
            ("DOCKET_METRICS_PORT", "9100"),
            ("DOCKET_LOCK_TIMEOUT_MS", "250"),
            ("DOCKET_COMPACT_THRESHOLD", "50"),
            ("DOCKET_NO_SHOW_GRACE_MS", "900000"),
            ("DOCKET_SWEEP_INTERVAL_SECS", "5"),
        ]));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/docket"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.no_show_grace_ms, Some(900_000));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn bad_values_fall_back() {
        let config = Config::from_lookup(lookup_in(&[
            ("DOCKET_METRICS_PORT", "ninety"),
            ("DOCKET_COMPACT_THRESHOLD", "-3"),
            ("DOCKET_NO_SHOW_GRACE_MS", "-1"),
            ("DOCKET_SWEEP_INTERVAL_SECS", "0"),
        ]));
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.no_show_grace_ms, None);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }
}
