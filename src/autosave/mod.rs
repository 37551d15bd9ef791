//! Autosave of the active pattern's progress into the snapshot ring.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod controller;
mod scheduler;

pub use controller::{AutosaveState, DropReason, Phase, RequestOutcome, SaveAttemptController};
pub use scheduler::{
    AutosaveHandle, AutosaveSession, AutosaveStatus, ProgressSource, SnapshotWriter,
};

pub const SAVE_EVERY_MS: u64 = 300_000;
pub const IDLE_AFTER_MS: u64 = 360_000;
pub const TICK_MS: u64 = 30_000;
pub const RETRY_BASE_MS: u64 = 15_000;
pub const RETRY_MAX_MS: u64 = 120_000;
pub const ONLINE_RETRY_MS: u64 = 5_000;

/// Millisecond overrides as stored under `autosave` in config files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutosaveOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_every_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_retry_ms: Option<u64>,
}

impl AutosaveOverrides {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveConfig {
    pub save_every: Duration,
    pub idle_after: Duration,
    pub tick: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub online_retry: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            save_every: Duration::from_millis(SAVE_EVERY_MS),
            idle_after: Duration::from_millis(IDLE_AFTER_MS),
            tick: Duration::from_millis(TICK_MS),
            retry_base: Duration::from_millis(RETRY_BASE_MS),
            retry_max: Duration::from_millis(RETRY_MAX_MS),
            online_retry: Duration::from_millis(ONLINE_RETRY_MS),
        }
    }
}

impl AutosaveConfig {
    /// Apply overrides on top of the defaults. Zero values are ignored so a
    /// misconfigured file cannot produce a busy loop.
    pub fn from_overrides(overrides: &AutosaveOverrides) -> Self {
        let pick = |value: Option<u64>, default: Duration| match value {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => default,
        };
        let base = Self::default();
        let retry_base = pick(overrides.retry_base_ms, base.retry_base);
        Self {
            save_every: pick(overrides.save_every_ms, base.save_every),
            idle_after: pick(overrides.idle_after_ms, base.idle_after),
            tick: pick(overrides.tick_ms, base.tick),
            retry_base,
            retry_max: pick(overrides.retry_max_ms, base.retry_max).max(retry_base),
            online_retry: pick(overrides.online_retry_ms, base.online_retry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_only_named_tunables() {
        let config = AutosaveConfig::from_overrides(&AutosaveOverrides {
            tick_ms: Some(1_000),
            retry_max_ms: Some(0),
            ..Default::default()
        });
        assert_eq!(config.tick, Duration::from_secs(1));
        assert_eq!(config.retry_max, Duration::from_millis(RETRY_MAX_MS));
        assert_eq!(config.save_every, Duration::from_millis(SAVE_EVERY_MS));
    }

    #[test]
    fn retry_cap_never_falls_below_base() {
        let config = AutosaveConfig::from_overrides(&AutosaveOverrides {
            retry_base_ms: Some(60_000),
            retry_max_ms: Some(10_000),
            ..Default::default()
        });
        assert_eq!(config.retry_max, Duration::from_secs(60));
    }

    #[test]
    fn overrides_parse_from_config_json() {
        let overrides: AutosaveOverrides =
            serde_json::from_str(r#"{"save_every_ms": 60000}"#).unwrap();
        assert_eq!(overrides.save_every_ms, Some(60_000));
        assert!(!overrides.is_empty());
        assert!(AutosaveOverrides::default().is_empty());
    }
}
