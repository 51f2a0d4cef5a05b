//! Cluster resource model and the upgrade state machine
//!
//! [`ClusterResource`] is the single persisted aggregate per cluster. It holds
//! the last applied state, at most one in-flight [`PendingUpgrade`], and the
//! desired-state targets that have not been folded into a pending upgrade yet.

pub mod config;
pub mod document;
pub mod manifest;
pub mod node;
pub mod records;
pub mod reliability;
pub mod resource;

pub use config::{
    CsmConfig, NodeDescription, NodeTypeDescription, SettingsSection, UpgradeHealthPolicy,
    WrpConfig,
};
pub use manifest::ClusterManifest;
pub use node::{DeactivationIntent, NodeConfig, NodeState, NodeStatus};
pub use records::{CodeUpgradeDetail, ConfigUpgradeErrorDetail};
pub use reliability::{ReliabilityLevel, SystemServiceSize};
pub use resource::{
    ClusterResource, ClusterSnapshot, ExternalState, FailureReason, PendingUpgrade,
    UpgradeFailure, UpgradeFlow, UpgradeKind,
};
