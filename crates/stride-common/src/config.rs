//! Orchestrator configuration
//!
//! Configuration is loaded from YAML and re-read at the top of every
//! scheduling cycle through a [`ConfigSource`], so interval and window
//! changes take effect without a restart.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Top-level orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Identifier of the cluster this orchestrator manages
    pub cluster_id: String,
    /// How often the control loop wakes without an explicit trigger
    pub loop_interval_secs: u64,
    /// Interval between upgrade progress polls
    pub upgrade_poll_interval_secs: u64,
    /// Interval between node status polls
    pub node_poll_interval_secs: u64,
    /// Upper bound on waiting for disabling nodes to deactivate
    pub deactivation_timeout_secs: u64,
    /// Upper bound on waiting for added nodes to come up
    pub activation_timeout_secs: u64,
    /// Upper bound on a single resource store call
    pub store_timeout_secs: u64,
    /// Call-site retry policy for store and execution service calls
    pub retry: RetryConfig,
    /// Node addition is only supported on secure clusters
    pub secure_cluster: bool,
    /// Directory holding persisted records and downloaded packages
    pub data_root: PathBuf,
    /// Directory for temporary manifests; the system temp dir when unset
    pub temp_dir: Option<PathBuf>,
    /// Goal-state polling
    pub goal_state: GoalStateConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cluster_id: "default".to_string(),
            loop_interval_secs: 60,
            upgrade_poll_interval_secs: 10,
            node_poll_interval_secs: 5,
            deactivation_timeout_secs: 1800,
            activation_timeout_secs: 1800,
            store_timeout_secs: 30,
            retry: RetryConfig::default(),
            secure_cluster: false,
            data_root: PathBuf::from("/var/lib/stride"),
            temp_dir: None,
            goal_state: GoalStateConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Control loop wake interval
    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_secs)
    }

    /// Upgrade progress poll interval
    pub fn upgrade_poll_interval(&self) -> Duration {
        Duration::from_secs(self.upgrade_poll_interval_secs)
    }

    /// Node status poll interval
    pub fn node_poll_interval(&self) -> Duration {
        Duration::from_secs(self.node_poll_interval_secs)
    }

    /// Deactivation wait bound
    pub fn deactivation_timeout(&self) -> Duration {
        Duration::from_secs(self.deactivation_timeout_secs)
    }

    /// Activation wait bound
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }

    /// Store call bound
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    /// Directory for temporary manifests
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Reject settings that would make the loop spin or never time out
    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.trim().is_empty() {
            return Err(Error::validation_for_field("clusterId", "must not be empty"));
        }
        for (field, value) in [
            ("loopIntervalSecs", self.loop_interval_secs),
            ("upgradePollIntervalSecs", self.upgrade_poll_interval_secs),
            ("nodePollIntervalSecs", self.node_poll_interval_secs),
            ("deactivationTimeoutSecs", self.deactivation_timeout_secs),
            ("activationTimeoutSecs", self.activation_timeout_secs),
            ("storeTimeoutSecs", self.store_timeout_secs),
        ] {
            if value == 0 {
                return Err(Error::validation_for_field(field, "must be greater than zero"));
            }
        }
        if let Some(window) = &self.goal_state.provisioning_window {
            window.validate()?;
        }
        Ok(())
    }
}

/// Goal-state polling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GoalStateConfig {
    /// Automatic upgrades are only scheduled when enabled
    pub enabled: bool,
    /// Location of the published release manifest
    pub uri: Option<String>,
    /// How often the manifest is fetched
    pub poll_interval_secs: u64,
    /// Hours of the day (UTC) during which automatic upgrades may start
    pub provisioning_window: Option<ProvisioningWindow>,
    /// Warn this many days before the running version loses support
    pub expiry_reminder_days: i64,
}

impl Default for GoalStateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: None,
            poll_interval_secs: 24 * 60 * 60,
            provisioning_window: None,
            expiry_reminder_days: 30,
        }
    }
}

impl GoalStateConfig {
    /// Manifest fetch interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Support-expiry reminder window
    pub fn expiry_reminder(&self) -> chrono::Duration {
        chrono::Duration::days(self.expiry_reminder_days.max(0))
    }
}

/// A daily UTC window `[start_hour, end_hour)`; wraps past midnight when
/// `end_hour <= start_hour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningWindow {
    /// First hour (0-23) of the window
    pub start_hour: u32,
    /// Hour (0-23) at which the window closes
    pub end_hour: u32,
}

impl ProvisioningWindow {
    /// True if `now` falls inside the window
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let hour = now.hour();
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    fn validate(&self) -> Result<()> {
        if self.start_hour > 23 || self.end_hour > 23 {
            return Err(Error::validation_for_field(
                "goalState.provisioningWindow",
                "hours must be between 0 and 23",
            ));
        }
        Ok(())
    }
}

/// Supplies the current configuration; called once per scheduling cycle
pub trait ConfigSource: Send + Sync {
    /// Load the current configuration
    fn load(&self) -> Result<OrchestratorConfig>;
}

/// A fixed configuration
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource(pub OrchestratorConfig);

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<OrchestratorConfig> {
        Ok(self.0.clone())
    }
}

/// Configuration re-read from a YAML file on every load
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Read configuration from `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<OrchestratorConfig> {
        load_config(&self.path)
    }
}

/// Load and validate a YAML configuration file
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: OrchestratorConfig = serde_yaml::from_str(&content).map_err(|e| {
        Error::serialization_for_kind(
            "OrchestratorConfig",
            format!("failed to parse {}: {}", path.display(), e),
        )
    })?;
    config.validate()?;
    Ok(config)
}
