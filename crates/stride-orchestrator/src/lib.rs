//! Upgrade orchestration for stride
//!
//! The [`UpgradeOrchestrator`] drives one cluster from its persisted
//! [`ClusterResource`](stride_cluster::ClusterResource) through complete
//! upgrade attempts against an [`ExecutionService`]. It is resumable: every
//! iteration re-derives its next step from the store and from the execution
//! service's reported progress.

pub mod admin;
pub mod configurator;
pub mod context;
pub mod driver;
pub mod execution;
pub mod fault_injection;
pub mod goal_state;
pub mod health;
pub mod nodes;
pub mod orchestrator;
pub mod package;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use admin::{AdminService, ClusterUpgradeState, UpgradeStatus};
pub use configurator::NodeConfigurator;
pub use context::{Context, ContextBuilder};
pub use execution::{
    ExecutionService, NodeInfo, NodeRuntimeStatus, StartUpgradeRequest, SystemServiceInfo,
    UpgradeProgress, UpgradeState,
};
pub use goal_state::{GoalStatePoller, PollOutcome};
pub use health::{HealthProperty, HealthReport, HealthReporter, HealthState};
pub use orchestrator::{OrchestrationOutcome, UpgradeOrchestrator};
pub use package::{FilePackageStore, PackageStore, ReleasePackage};
pub use service::OrchestratorService;
