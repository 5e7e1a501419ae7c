//! Engine configuration, usually embedded as an `[engine]` table in TOML.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Environment variables that override `max_workers`, highest priority first.
/// The second is the name the challenge platform sets.
pub const MAX_WORKERS_ENV: [&str; 2] = ["EVAL_MAX_WORKERS", "GRAND_CHALLENGE_MAX_WORKERS"];

/// Tuning knobs for a batch run.
///
/// Missing fields default to values suitable for unattended container runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrent workers. Unset means every available core.
    /// Values above the available parallelism are clamped down.
    pub max_workers: Option<i64>,

    /// Seconds a worker gets to exit on its own before it is killed.
    pub cleanup_grace_secs: u64,

    /// Seconds to wait for a single item's reply before failing it.
    pub item_timeout_secs: u64,

    /// Polling period for exit supervision and cleanup, in milliseconds.
    pub supervise_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            cleanup_grace_secs: 5,
            item_timeout_secs: 60 * 60,
            supervise_interval_ms: 50,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(max_workers) = self.max_workers
            && max_workers < 1
        {
            return Err(anyhow!("max_workers must be >= 1 (got {max_workers})"));
        }
        if self.item_timeout_secs == 0 {
            return Err(anyhow!("item_timeout_secs must be > 0"));
        }
        if self.supervise_interval_ms == 0 {
            return Err(anyhow!("supervise_interval_ms must be > 0"));
        }
        Ok(())
    }

    /// Apply the first non-empty `MAX_WORKERS_ENV` variable `lookup` finds.
    pub fn with_env_override(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let found = MAX_WORKERS_ENV.iter().find_map(|name| {
            lookup(name)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
                .map(|raw| (*name, raw))
        });
        if let Some((name, raw)) = found {
            let value: i64 = raw.parse().with_context(|| format!("parse {name}={raw}"))?;
            self.max_workers = Some(value);
        }
        self.validate()?;
        Ok(self)
    }

    /// Number of workers to run given `available` execution units.
    ///
    /// Never below 1 and never above `available`.
    pub fn resolve_workers(&self, available: usize) -> usize {
        let available = available.max(1);
        match self.max_workers {
            Some(requested) => usize::try_from(requested).unwrap_or(1).clamp(1, available),
            None => available,
        }
    }

    /// `resolve_workers` against the host's available parallelism.
    pub fn effective_workers(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1);
        self.resolve_workers(available)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_millis(self.supervise_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        EngineConfig::default().validate().expect("valid");
    }

    #[test]
    fn rejects_non_positive_max_workers() {
        for bad in [0, -1, -64] {
            let cfg = EngineConfig {
                max_workers: Some(bad),
                ..EngineConfig::default()
            };
            let err = cfg.validate().expect_err("should reject");
            assert!(err.to_string().contains("max_workers"));
        }
    }

    #[test]
    fn resolve_clamps_to_available() {
        let cfg = EngineConfig {
            max_workers: Some(64),
            ..EngineConfig::default()
        };
        assert_eq!(cfg.resolve_workers(8), 8);

        let cfg = EngineConfig {
            max_workers: Some(3),
            ..EngineConfig::default()
        };
        assert_eq!(cfg.resolve_workers(8), 3);
    }

    #[test]
    fn resolve_defaults_to_available_and_never_zero() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.resolve_workers(6), 6);
        assert_eq!(cfg.resolve_workers(0), 1);

        // Bypasses validate(): the resolver still refuses to go below one.
        let cfg = EngineConfig {
            max_workers: Some(-5),
            ..EngineConfig::default()
        };
        assert_eq!(cfg.resolve_workers(4), 1);
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn env_override_replaces_max_workers() {
        let cfg = EngineConfig::default()
            .with_env_override(vars(&[("EVAL_MAX_WORKERS", " 2 ")]))
            .expect("override");
        assert_eq!(cfg.max_workers, Some(2));

        let cfg = EngineConfig::default()
            .with_env_override(vars(&[]))
            .expect("no override");
        assert_eq!(cfg.max_workers, None);

        assert!(
            EngineConfig::default()
                .with_env_override(vars(&[("EVAL_MAX_WORKERS", "0")]))
                .is_err()
        );
        let err = EngineConfig::default()
            .with_env_override(vars(&[("EVAL_MAX_WORKERS", "many")]))
            .expect_err("not a number");
        assert!(format!("{err:#}").contains("EVAL_MAX_WORKERS=many"));
    }

    #[test]
    fn platform_variable_is_a_fallback() {
        let cfg = EngineConfig::default()
            .with_env_override(vars(&[("GRAND_CHALLENGE_MAX_WORKERS", "3")]))
            .expect("platform override");
        assert_eq!(cfg.max_workers, Some(3));

        let cfg = EngineConfig::default()
            .with_env_override(vars(&[
                ("EVAL_MAX_WORKERS", "2"),
                ("GRAND_CHALLENGE_MAX_WORKERS", "3"),
            ]))
            .expect("both set");
        assert_eq!(cfg.max_workers, Some(2));

        // An empty primary variable does not shadow the fallback.
        let cfg = EngineConfig::default()
            .with_env_override(vars(&[
                ("EVAL_MAX_WORKERS", " "),
                ("GRAND_CHALLENGE_MAX_WORKERS", "1"),
            ]))
            .expect("fallback");
        assert_eq!(cfg.max_workers, Some(1));

        let err = EngineConfig::default()
            .with_env_override(vars(&[("GRAND_CHALLENGE_MAX_WORKERS", "-4")]))
            .expect_err("non-positive");
        assert!(err.to_string().contains("max_workers"));
    }
}
