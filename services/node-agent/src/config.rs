//! Configuration for the node agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_id::HostName;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the host the agent runs on.
    pub hostname: HostName,

    /// Data directory holding the nodes' storage.
    pub data_dir: PathBuf,

    /// Interval between node spec fetches in seconds.
    pub tick_interval_secs: u64,

    /// Warm-up window after a node's first healthy check, in seconds.
    /// Zero disables warm-up.
    pub warm_up_secs: u64,

    /// How long to wait for agents to acknowledge a freeze, in seconds.
    pub freeze_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let hostname = std::env::var("FLEET_HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let hostname = HostName::parse(&hostname)
            .with_context(|| format!("invalid FLEET_HOSTNAME {hostname:?}"))?;

        let data_dir = std::env::var("FLEET_DATA_DIR")
            .unwrap_or_else(|_| "/var/lib/fleet".to_string())
            .into();

        let tick_interval_secs = env_u64("FLEET_TICK_INTERVAL").unwrap_or(30);
        let warm_up_secs = env_u64("FLEET_WARM_UP_SECS").unwrap_or(0);
        let freeze_timeout_secs = env_u64("FLEET_FREEZE_TIMEOUT").unwrap_or(5);

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            hostname,
            data_dir,
            tick_interval_secs,
            warm_up_secs,
            freeze_timeout_secs,
            log_level,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn warm_up(&self) -> Duration {
        Duration::from_secs(self.warm_up_secs)
    }

    pub fn freeze_timeout(&self) -> Duration {
        Duration::from_secs(self.freeze_timeout_secs)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
