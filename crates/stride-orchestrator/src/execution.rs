//! The cluster execution service command surface
//!
//! The execution service copies bits, restarts processes and walks upgrade
//! domains. The orchestrator treats it as a black box reached through
//! [`ExecutionService`]; the wire protocol is supplied by the embedding
//! process.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stride_cluster::{DeactivationIntent, FailureReason, SystemServiceSize, UpgradeHealthPolicy};
use stride_common::{CodeVersion, Result};

#[cfg(test)]
use mockall::automock;

/// Upgrade state reported by the execution service
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum UpgradeState {
    /// Accepted, not started
    RollingForwardPending,
    /// Walking upgrade domains
    RollingForwardInProgress,
    /// Reverting after a failure
    RollingBackInProgress,
    /// Finished successfully
    RollingForwardCompleted,
    /// Reverted
    RollingBackCompleted,
    /// Gave up
    Failed,
}

impl UpgradeState {
    /// True once the upgrade will not make further progress
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RollingForwardCompleted | Self::RollingBackCompleted | Self::Failed
        )
    }

    /// True while rolling forward
    pub fn is_rolling_forward(&self) -> bool {
        matches!(self, Self::RollingForwardPending | Self::RollingForwardInProgress)
    }
}

impl std::fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RollingForwardPending => write!(f, "RollingForwardPending"),
            Self::RollingForwardInProgress => write!(f, "RollingForwardInProgress"),
            Self::RollingBackInProgress => write!(f, "RollingBackInProgress"),
            Self::RollingForwardCompleted => write!(f, "RollingForwardCompleted"),
            Self::RollingBackCompleted => write!(f, "RollingBackCompleted"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Read-only view of the execution service's current upgrade
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeProgress {
    /// Upgrade state
    pub upgrade_state: UpgradeState,
    /// Code version being upgraded to
    pub target_code_version: CodeVersion,
    /// Config (manifest) version being upgraded to
    pub target_config_version: String,
    /// Why the upgrade did not roll forward
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    /// When it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_timestamp: Option<DateTime<Utc>>,
}

impl UpgradeProgress {
    /// True if the progress is about the given target
    pub fn targets(&self, code_version: &CodeVersion, config_version: &str) -> bool {
        self.target_code_version == *code_version && self.target_config_version == config_version
    }
}

/// Parameters of a start-upgrade command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartUpgradeRequest {
    /// Serialized cluster manifest
    pub manifest_path: PathBuf,
    /// Target code version
    pub code_version: CodeVersion,
    /// Target config version
    pub config_version: String,
    /// Health policy
    pub policy: UpgradeHealthPolicy,
}

/// Runtime status of a node as seen by the execution service
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum NodeRuntimeStatus {
    /// Running and part of the cluster
    Up,
    /// Not reachable
    Down,
    /// Being activated
    Enabling,
    /// Being deactivated
    Disabling,
    /// Deactivated
    Disabled,
    /// No longer known
    Invalid,
    /// Status could not be determined
    Unknown,
}

impl NodeRuntimeStatus {
    /// True once deactivation has finished (or the node is gone)
    pub fn is_deactivated(&self) -> bool {
        matches!(self, Self::Disabled | Self::Invalid)
    }

    /// True if a deactivate command would be redundant
    pub fn is_deactivating_or_gone(&self) -> bool {
        matches!(self, Self::Disabled | Self::Disabling | Self::Invalid)
    }
}

/// A node as listed by the execution service
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Runtime status
    pub status: NodeRuntimeStatus,
    /// Fault domain
    pub fault_domain: String,
    /// Upgrade domain
    pub upgrade_domain: String,
    /// Machine address
    pub address: String,
}

/// A stateful system service and its replica sizing
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemServiceInfo {
    /// Service name
    pub name: String,
    /// Current size
    pub size: SystemServiceSize,
}

/// Trait abstracting the cluster execution service
///
/// Every command is expected to be idempotent or guarded by a progress check
/// on the caller's side; callers wrap each call in the retry policy.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Start (or interrupt the running upgrade with) an upgrade
    ///
    /// # Arguments
    ///
    /// * `request` - Manifest location, target versions and health policy
    async fn start_upgrade(&self, request: &StartUpgradeRequest) -> Result<()>;

    /// Progress of the current or last upgrade
    async fn get_upgrade_progress(&self) -> Result<UpgradeProgress>;

    /// Make a code package available to the cluster
    ///
    /// # Arguments
    ///
    /// * `code_version` - Version contained in the package
    /// * `package_path` - Local path of the downloaded package
    async fn provision(&self, code_version: &CodeVersion, package_path: &Path) -> Result<()>;

    /// Remove a provisioned code package
    async fn unprovision(&self, code_version: &CodeVersion) -> Result<()>;

    /// Provisioned versions, optionally filtered to one version
    async fn list_provisioned_versions(
        &self,
        code_version: Option<CodeVersion>,
    ) -> Result<Vec<CodeVersion>>;

    /// Ask a node to deactivate
    async fn deactivate_node(&self, node_name: &str, intent: DeactivationIntent) -> Result<()>;

    /// Ask a node to activate
    async fn activate_node(&self, node_name: &str) -> Result<()>;

    /// Forget all state of a removed node
    async fn remove_node_state(&self, node_name: &str) -> Result<()>;

    /// Current node list
    async fn get_node_list(&self) -> Result<Vec<NodeInfo>>;

    /// Stateful system services present in the cluster
    async fn list_system_services(&self) -> Result<Vec<SystemServiceInfo>>;

    /// Resize a system service
    async fn update_system_service(&self, service_name: &str, size: SystemServiceSize)
        -> Result<()>;
}
