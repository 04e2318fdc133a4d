//! resync apply: a directory of YAML files acting as the remote store, plus
//! the YAML guards and diff summaries used around it.

#![forbid(unsafe_code)]

use std::time::Duration;

mod dir;
mod doc;

pub use dir::DirStore;
pub use doc::{node_budget_exceeded, parse_document, render_document, DiffSummary};

/// Tunables for [`DirStore`], read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyConfig {
    pub poll_interval: Duration,
    pub max_yaml_bytes: usize,
    pub max_yaml_nodes: usize,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_yaml_bytes: 1_000_000, // 1 MiB default
            max_yaml_nodes: 100_000,
        }
    }
}

impl ApplyConfig {
    /// `RESYNC_POLL_MS`, `RESYNC_MAX_YAML_BYTES`, `RESYNC_MAX_YAML_NODES`;
    /// unset or unparsable values keep the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: env_u64("RESYNC_POLL_MS").map(Duration::from_millis).unwrap_or(d.poll_interval),
            max_yaml_bytes: env_u64("RESYNC_MAX_YAML_BYTES").map(|v| v as usize).unwrap_or(d.max_yaml_bytes),
            max_yaml_nodes: env_u64("RESYNC_MAX_YAML_NODES").map(|v| v as usize).unwrap_or(d.max_yaml_nodes),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        // No other test in this crate reads these variables.
        std::env::set_var("RESYNC_MAX_YAML_NODES", "42");
        std::env::set_var("RESYNC_POLL_MS", "not-a-number");
        let cfg = ApplyConfig::from_env();
        std::env::remove_var("RESYNC_MAX_YAML_NODES");
        std::env::remove_var("RESYNC_POLL_MS");
        assert_eq!(cfg.max_yaml_nodes, 42);
        assert_eq!(cfg.poll_interval, Duration::from_millis(1000));
        assert_eq!(cfg.max_yaml_bytes, 1_000_000);
    }
}
