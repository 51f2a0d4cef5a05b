//! The upgrade control loop
//!
//! One call to [`UpgradeOrchestrator::orchestrate_upgrade`] runs iterations
//! until no upgrade is pending. Each iteration starts from a fresh read of
//! the [`ClusterResource`]; writes are snapshot-guarded and a write that
//! loses a race is dropped, so the next iteration re-derives its intent from
//! whatever the winner persisted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use stride_cluster::{
    ClusterResource, CodeUpgradeDetail, ConfigUpgradeErrorDetail, FailureReason, NodeStatus,
    PendingUpgrade, SystemServiceSize, UpgradeKind, WrpConfig,
};
use stride_common::config::OrchestratorConfig;
use stride_common::retry::retry_if_retryable;
use stride_common::{CodeVersion, Error, Result};
use stride_store::Stored;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::driver::UpgradeDriver;
use crate::execution::UpgradeState;
use crate::fault_injection;
use crate::health::{HealthProperty, HealthReport, HealthState};
use crate::nodes::NodeLifecycleManager;

/// Stateful system services resized after a reliability tier change
pub const SYSTEM_SERVICES: &[&str] = &[
    "fabric:/System/ClusterManagerService",
    "fabric:/System/NamingService",
    "fabric:/System/ImageStoreService",
    "fabric:/System/UpgradeOrchestrationService",
    "fabric:/System/FaultAnalysisService",
    "fabric:/System/BackupRestoreService",
];

/// How a call to [`UpgradeOrchestrator::orchestrate_upgrade`] ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrchestrationOutcome {
    /// Nothing to do
    Idle,
    /// The cluster reached a new state
    Completed {
        /// Code version now running
        code_version: CodeVersion,
        /// Config version now applied
        config_version: String,
    },
    /// The execution service rolled the upgrade back or gave up
    RolledBack {
        /// Reported reason
        reason: FailureReason,
    },
    /// The attempt was abandoned and the targets reset
    Abandoned {
        /// Error code recorded in the error detail
        error_code: String,
    },
}

impl std::fmt::Display for OrchestrationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Completed {
                code_version,
                config_version,
            } => write!(f, "Completed({}, {})", code_version, config_version),
            Self::RolledBack { reason } => write!(f, "RolledBack({})", reason),
            Self::Abandoned { error_code } => write!(f, "Abandoned({})", error_code),
        }
    }
}

enum Step {
    Continue,
    Done(OrchestrationOutcome),
}

/// Drives a cluster through complete upgrade attempts
pub struct UpgradeOrchestrator {
    ctx: Arc<Context>,
    data_loss_reported: AtomicBool,
}

impl UpgradeOrchestrator {
    /// Create an orchestrator over `ctx`
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            data_loss_reported: AtomicBool::new(false),
        }
    }

    /// The shared context
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Run iterations until no upgrade is pending
    ///
    /// Configuration is re-read on every call. Rolled back and abandoned
    /// attempts are outcomes, not errors; errors are failed store or
    /// execution service calls that a later call can retry, a missing
    /// resource, and cancellation.
    pub async fn orchestrate_upgrade(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OrchestrationOutcome> {
        let config = self.ctx.load_config()?;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled("orchestrate_upgrade"));
            }
            match self.iterate(&config, cancel).await? {
                Step::Continue => continue,
                Step::Done(outcome) => {
                    info!(outcome = %outcome, "orchestration finished");
                    return Ok(outcome);
                }
            }
        }
    }

    async fn iterate(&self, config: &OrchestratorConfig, cancel: &CancellationToken) -> Result<Step> {
        let mut stored = self.load_resource().await?;

        if let Some(step) = self.apply_code_upgrade_detail(&mut stored, config).await? {
            return Ok(step);
        }

        let mut stored = self.load_resource().await?;
        let changed = match stored.value.run_state_machine(Utc::now()) {
            Ok(changed) => changed,
            Err(e) => return self.abandon(e).await,
        };
        if changed {
            if !self.persist(&mut stored).await? {
                return Ok(Step::Continue);
            }
            stored = self.load_resource().await?;
        }

        let disabling = stored.value.disabling_nodes();
        if stored.value.pending.is_none() && disabling.is_empty() {
            debug!(cluster = %stored.value.cluster_id, "no upgrade pending");
            return Ok(Step::Done(OrchestrationOutcome::Idle));
        }

        let nodes = NodeLifecycleManager::new(&self.ctx, config);
        if !disabling.is_empty() {
            if let Err(e) = nodes.deactivate_nodes(&disabling).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                if !e.is_timeout() {
                    return self.abandon(e).await;
                }
                warn!(error = %e, "deactivation timed out, continuing");
            }
        }

        if stored.value.pending.is_none() {
            if let Err(e) = self
                .synthesize_removal(&mut stored.value, &disabling, &nodes, cancel)
                .await
            {
                if e.is_cancelled() {
                    return Err(e);
                }
                return self.abandon(e).await;
            }
            if !self.persist(&mut stored).await? {
                return Ok(Step::Continue);
            }
        }

        let Some(pending) = stored.value.pending.clone() else {
            return Ok(Step::Continue);
        };

        if config.secure_cluster {
            let added = stored.value.added_nodes();
            if !added.is_empty() {
                let running = stored.value.current.external_state.code_version.clone();
                if let Err(e) = nodes
                    .add_nodes(&added, &pending.target.external_state.manifest, &running, cancel)
                    .await
                {
                    if e.is_cancelled() {
                        return Err(e);
                    }
                    return self.abandon(e).await;
                }
            }
        }

        let final_state = if matches!(pending.kind, UpgradeKind::ServiceResize { .. }) {
            debug!("resuming system service resize");
            UpgradeState::RollingForwardCompleted
        } else {
            let injected =
                fault_injection::inject_fault(&stored.value, self.ctx.health.as_ref()).await;
            let driven = UpgradeDriver::new(&self.ctx, config)
                .drive(&pending, cancel)
                .await;
            if injected {
                fault_injection::clear_fault(self.ctx.health.as_ref()).await;
            }
            match driven {
                Ok(progress) if progress.upgrade_state == UpgradeState::RollingForwardCompleted => {
                    UpgradeState::RollingForwardCompleted
                }
                Ok(progress) => {
                    stored.value.cluster_upgrade_rolled_back_or_failed(
                        progress.failure_timestamp.unwrap_or_else(Utc::now),
                        progress.failure_reason.unwrap_or_default(),
                    );
                    progress.upgrade_state
                }
                Err(e) if e.is_cancelled() || e.is_retryable() => return Err(e),
                Err(e) => return self.abandon(e).await,
            }
        };

        let outcome = if final_state == UpgradeState::RollingForwardCompleted {
            if let Err(e) = self
                .complete(&mut stored.value, &pending, &nodes, config, cancel)
                .await
            {
                if e.is_cancelled() {
                    return Err(e);
                }
                return self.abandon(e).await;
            }
            OrchestrationOutcome::Completed {
                code_version: stored.value.current.external_state.code_version.clone(),
                config_version: stored.value.current.external_state.config_version().to_string(),
            }
        } else {
            OrchestrationOutcome::RolledBack {
                reason: stored
                    .value
                    .last_failure
                    .as_ref()
                    .map(|f| f.reason)
                    .unwrap_or_default(),
            }
        };

        if stored.value.pending.is_some() {
            self.persist(&mut stored).await?;
            return Ok(Step::Continue);
        }

        stored.value.reset();
        let reached = stored.value.current.external_state.code_version.clone();
        if !self.persist(&mut stored).await? {
            return Ok(Step::Continue);
        }
        self.clear_error_detail().await;
        self.cleanup_packages(pending.code_version(), &reached, config)
            .await;
        Ok(Step::Done(outcome))
    }

    /// Load the resource, re-persisting blobs written by older builds
    async fn load_resource(&self) -> Result<Stored<ClusterResource>> {
        let Some(mut stored) = self.ctx.store.load::<ClusterResource>().await? else {
            if !self.data_loss_reported.swap(true, Ordering::SeqCst) {
                error!("cluster resource is missing from the store");
            }
            self.ctx
                .health
                .report(HealthReport::new(
                    HealthProperty::DataLossRecovery,
                    HealthState::Error,
                    "cluster resource is missing; re-initialize the orchestrator state",
                ))
                .await;
            return Err(Error::not_found("ClusterResource", "cluster-resource"));
        };

        if self.data_loss_reported.swap(false, Ordering::SeqCst) {
            self.ctx
                .health
                .report(HealthReport::ok(HealthProperty::DataLossRecovery))
                .await;
        }

        if stored.normalized {
            info!("re-persisting cluster resource written by an older version");
            if self.persist(&mut stored).await? {
                stored.normalized = false;
            } else if let Some(fresh) = self.ctx.store.load::<ClusterResource>().await? {
                stored = fresh;
            }
        }
        Ok(stored)
    }

    /// Snapshot-guarded write; `Ok(false)` means another writer won
    async fn persist(&self, stored: &mut Stored<ClusterResource>) -> Result<bool> {
        match self.ctx.store.save(&stored.value, Some(&stored.snapshot)).await {
            Ok(token) => {
                stored.snapshot = token;
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                info!("cluster resource changed concurrently, dropping write");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Fold a requested code version into the target admin configuration
    async fn apply_code_upgrade_detail(
        &self,
        stored: &mut Stored<ClusterResource>,
        config: &OrchestratorConfig,
    ) -> Result<Option<Step>> {
        if stored.value.has_pending() {
            return Ok(None);
        }
        let detail = self
            .ctx
            .store
            .load::<CodeUpgradeDetail>()
            .await?
            .map(|s| s.value)
            .unwrap_or_default();
        let Some(requested) = detail.code_version else {
            return Ok(None);
        };

        let resource = &stored.value;
        let effective = &resource
            .target_wrp_config
            .as_ref()
            .unwrap_or(&resource.current.wrp_config)
            .code_version;
        if requested == *effective {
            return Ok(None);
        }

        info!(
            requested = %requested,
            running = %resource.current.wrp_config.code_version,
            user_initiated = detail.is_user_initiated,
            "preparing code upgrade"
        );
        match self
            .prepare_code_package(&requested, detail.is_user_initiated, config)
            .await
        {
            Ok(wrp) => {
                stored.value.set_target_wrp_config(wrp);
                if !self.persist(stored).await? {
                    return Ok(Some(Step::Continue));
                }
                Ok(None)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => Ok(Some(self.abandon(e).await?)),
        }
    }

    async fn prepare_code_package(
        &self,
        version: &CodeVersion,
        user_initiated: bool,
        config: &OrchestratorConfig,
    ) -> Result<WrpConfig> {
        let execution = self.ctx.execution.clone();
        let provisioned = retry_if_retryable(&config.retry, "list_provisioned_versions", || {
            let execution = execution.clone();
            let version = version.clone();
            async move { execution.list_provisioned_versions(Some(version)).await }
        })
        .await?
        .contains(version);

        let package_path = self.ctx.packages.download(version, None).await?;
        let result = async {
            if !provisioned {
                retry_if_retryable(&config.retry, "provision", || {
                    let execution = execution.clone();
                    let package_path = package_path.clone();
                    async move { execution.provision(version, &package_path).await }
                })
                .await?;
                info!(version = %version, "package provisioned");
            }
            let mut wrp = self.ctx.packages.extract_configuration(&package_path).await?;
            if wrp.code_version != *version {
                return Err(Error::package(
                    version.to_string(),
                    format!("package configuration is for version {}", wrp.code_version),
                ));
            }
            wrp.is_user_initiated = user_initiated;
            Ok(wrp)
        }
        .await;

        if let Err(e) = self.ctx.packages.remove_local(&package_path).await {
            debug!(path = %package_path.display(), error = %e, "failed to remove local package");
        }
        result
    }

    /// Turn deactivated disabling nodes into a removal upgrade
    async fn synthesize_removal(
        &self,
        resource: &mut ClusterResource,
        disabling: &[NodeStatus],
        nodes: &NodeLifecycleManager<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        nodes.poll_deactivated_nodes(disabling, cancel).await?;

        let version = resource
            .target_node_config
            .as_ref()
            .unwrap_or(&resource.current.node_config)
            .version;
        if !resource.set_target_node_config_for_removed_nodes(disabling, version) {
            return Err(Error::internal_with_context(
                "orchestrator",
                "no disabling node could be marked removed",
            ));
        }
        if !resource.run_state_machine(Utc::now())? {
            return Err(Error::internal_with_context(
                "orchestrator",
                "node removal did not produce an upgrade",
            ));
        }
        info!(removed = disabling.len(), "node removal upgrade created");
        Ok(())
    }

    /// Fold a completed upgrade into `current` and run its follow-ups
    async fn complete(
        &self,
        resource: &mut ClusterResource,
        pending: &PendingUpgrade,
        nodes: &NodeLifecycleManager<'_>,
        config: &OrchestratorConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut resize = match pending.kind {
            UpgradeKind::ServiceResize {
                target_system_services_size,
            } => Some(target_system_services_size),
            _ => None,
        };
        resource.cluster_upgrade_completed();

        if let Some(PendingUpgrade {
            kind: UpgradeKind::ServiceResize {
                target_system_services_size,
            },
            ..
        }) = &resource.pending
        {
            resize = Some(*target_system_services_size);
            resource.cluster_upgrade_completed();
        }
        if let Some(size) = resize {
            self.resize_system_services(size, config).await;
        }

        if resource.pending.is_none() {
            let disabling = resource.disabling_nodes();
            if !disabling.is_empty() {
                nodes.deactivate_nodes(&disabling).await?;
                self.synthesize_removal(resource, &disabling, nodes, cancel)
                    .await?;
            }
        }

        nodes.remove_node_states(&resource.removed_nodes()).await;
        Ok(())
    }

    /// Apply a system service size, best-effort per service
    async fn resize_system_services(&self, size: SystemServiceSize, config: &OrchestratorConfig) {
        let execution = self.ctx.execution.clone();
        let services = match retry_if_retryable(&config.retry, "list_system_services", || {
            let execution = execution.clone();
            async move { execution.list_system_services().await }
        })
        .await
        {
            Ok(services) => services,
            Err(e) => {
                warn!(error = %e, "failed to list system services, skipping resize");
                return;
            }
        };

        for name in SYSTEM_SERVICES {
            let Some(service) = services.iter().find(|s| s.name == *name) else {
                debug!(service = %name, "system service not present");
                continue;
            };
            if service.size == size {
                continue;
            }
            let result = retry_if_retryable(&config.retry, "update_system_service", || {
                let execution = execution.clone();
                async move { execution.update_system_service(name, size).await }
            })
            .await;
            match result {
                Ok(()) => info!(
                    service = %name,
                    target = size.target_replica_set_size,
                    min = size.min_replica_set_size,
                    "system service resized"
                ),
                Err(e) => warn!(service = %name, error = %e, "failed to resize system service"),
            }
        }
    }

    /// Drop the attempt: clear `pending`, reset targets, record the error
    async fn abandon(&self, err: Error) -> Result<Step> {
        error!(error = %err, code = err.error_code(), "abandoning upgrade attempt");

        let mut stored = self.load_resource().await?;
        stored.value.pending = None;
        stored.value.reset();
        if !self.persist(&mut stored).await? {
            warn!("reset after abandoned attempt lost a race");
        }

        if let Err(e) = self
            .ctx
            .store
            .update::<CodeUpgradeDetail, _>(|d| *d = CodeUpgradeDetail::default())
            .await
        {
            warn!(error = %e, "failed to clear code upgrade detail");
        }
        let detail = ConfigUpgradeErrorDetail::from_error(&err);
        if let Err(e) = self
            .ctx
            .store
            .update::<ConfigUpgradeErrorDetail, _>(|d| *d = detail)
            .await
        {
            warn!(error = %e, "failed to record upgrade error detail");
        }

        Ok(Step::Done(OrchestrationOutcome::Abandoned {
            error_code: err.error_code().to_string(),
        }))
    }

    async fn clear_error_detail(&self) {
        let cleared = self
            .ctx
            .store
            .update::<ConfigUpgradeErrorDetail, _>(|d| *d = ConfigUpgradeErrorDetail::default())
            .await;
        if let Err(e) = cleared {
            warn!(error = %e, "failed to clear upgrade error detail");
        }
    }

    /// Unprovision packages no longer needed, best-effort
    ///
    /// The reached version and a still-requested version are kept. The
    /// code upgrade detail is cleared once it refers to the attempted or
    /// reached version.
    async fn cleanup_packages(
        &self,
        attempted: &CodeVersion,
        reached: &CodeVersion,
        config: &OrchestratorConfig,
    ) {
        let detail = match self.ctx.store.load::<CodeUpgradeDetail>().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "failed to read code upgrade detail, skipping cleanup");
                return;
            }
        };
        let requested = detail.as_ref().and_then(|s| s.value.code_version.clone());
        let fulfilled = requested
            .as_ref()
            .map(|v| v == attempted || v == reached)
            .unwrap_or(false);
        let keep = if fulfilled { None } else { requested };

        let execution = self.ctx.execution.clone();
        match retry_if_retryable(&config.retry, "list_provisioned_versions", || {
            let execution = execution.clone();
            async move { execution.list_provisioned_versions(None).await }
        })
        .await
        {
            Ok(versions) => {
                for version in versions {
                    if version == *reached || Some(&version) == keep.as_ref() {
                        continue;
                    }
                    match execution.unprovision(&version).await {
                        Ok(()) => info!(version = %version, "package unprovisioned"),
                        Err(e) => warn!(version = %version, error = %e, "failed to unprovision package"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to list provisioned versions"),
        }

        if let (true, Some(stored)) = (fulfilled, detail) {
            let cleared = Stored {
                value: CodeUpgradeDetail::default(),
                snapshot: stored.snapshot,
                normalized: false,
            };
            if let Err(e) = self.ctx.store.save_stored(&cleared).await {
                warn!(error = %e, "failed to clear code upgrade detail");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{MockExecutionService, SystemServiceInfo, UpgradeProgress};
    use crate::health::MockHealthReporter;
    use crate::package::MockPackageStore;
    use crate::testing::{csm, memory_store, v, wrp};
    use std::sync::atomic::AtomicU32;
    use stride_store::StoreManager;

    fn progress(state: UpgradeState, code: &str, config: &str) -> UpgradeProgress {
        UpgradeProgress {
            upgrade_state: state,
            target_code_version: v(code),
            target_config_version: config.to_string(),
            failure_reason: None,
            failure_timestamp: None,
        }
    }

    async fn seed(store: &StoreManager, resource: &ClusterResource) {
        store.save(resource, None).await.unwrap();
    }

    async fn load(store: &StoreManager) -> ClusterResource {
        store.load::<ClusterResource>().await.unwrap().unwrap().value
    }

    fn orchestrator(
        store: StoreManager,
        execution: MockExecutionService,
        packages: MockPackageStore,
        health: MockHealthReporter,
    ) -> UpgradeOrchestrator {
        let ctx = Context::for_testing(
            store,
            Arc::new(execution),
            Arc::new(packages),
            Arc::new(health),
        );
        UpgradeOrchestrator::new(Arc::new(ctx))
    }

    fn quiet_health() -> MockHealthReporter {
        let mut health = MockHealthReporter::new();
        health.expect_report().returning(|_| ());
        health
    }

    #[tokio::test]
    async fn idle_cluster_does_nothing() {
        let (_, store) = memory_store();
        seed(&store, &ClusterResource::new("c1", csm("1.0", 3), wrp("5.0")).unwrap()).await;

        let orch = orchestrator(
            store,
            MockExecutionService::new(),
            MockPackageStore::new(),
            MockHealthReporter::new(),
        );
        let outcome = orch
            .orchestrate_upgrade(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, OrchestrationOutcome::Idle);
    }

    #[tokio::test]
    async fn story_missing_resource_reports_data_loss_until_restored() {
        let (_, store) = memory_store();
        let mut health = MockHealthReporter::new();
        health
            .expect_report()
            .withf(|r| r.property == HealthProperty::DataLossRecovery && r.state == HealthState::Error)
            .times(1)
            .returning(|_| ());
        health
            .expect_report()
            .withf(|r| r.property == HealthProperty::DataLossRecovery && r.state == HealthState::Ok)
            .times(1)
            .returning(|_| ());

        let orch = orchestrator(
            store.clone(),
            MockExecutionService::new(),
            MockPackageStore::new(),
            health,
        );
        let err = orch
            .orchestrate_upgrade(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        seed(&store, &ClusterResource::new("c1", csm("1.0", 3), wrp("5.0")).unwrap()).await;
        orch.orchestrate_upgrade(&CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn story_config_upgrade_completes() {
        let (_, store) = memory_store();
        let mut resource = ClusterResource::new("c1", csm("1.0", 3), wrp("5.0")).unwrap();
        resource.set_target_csm_config(csm("2.0", 3)).unwrap();
        seed(&store, &resource).await;

        let mut execution = MockExecutionService::new();
        let started = Arc::new(AtomicBool::new(false));
        let started_flag = started.clone();
        execution.expect_get_upgrade_progress().returning(move || {
            if started_flag.load(Ordering::SeqCst) {
                Ok(progress(UpgradeState::RollingForwardCompleted, "5.0", "2.0-n1"))
            } else {
                Ok(progress(UpgradeState::RollingForwardCompleted, "5.0", "1.0-n1"))
            }
        });
        let started_flag = started.clone();
        execution.expect_start_upgrade().times(1).returning(move |r| {
            assert_eq!(r.config_version, "2.0-n1");
            started_flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        execution
            .expect_list_provisioned_versions()
            .returning(|_| Ok(vec![v("5.0")]));

        let orch = orchestrator(
            store.clone(),
            execution,
            MockPackageStore::new(),
            quiet_health(),
        );

        let outcome = orch
            .orchestrate_upgrade(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            OrchestrationOutcome::Completed {
                code_version: v("5.0"),
                config_version: "2.0-n1".into(),
            }
        );

        let after = load(&store).await;
        assert!(after.pending.is_none());
        assert!(after.target_csm_config.is_none());
        assert_eq!(after.current.csm_config.version, "2.0");
    }

    #[tokio::test]
    async fn story_invalid_target_abandons_and_records_error() {
        let (raw, store) = memory_store();
        let mut resource = ClusterResource::new("c1", csm("1.0", 3), wrp("5.0")).unwrap();
        let mut bad = csm("2.0", 3);
        bad.nodes[0].node_type_ref = "missing".into();
        resource.target_csm_config = Some(bad);
        seed(&store, &resource).await;

        let orch = orchestrator(
            store.clone(),
            MockExecutionService::new(),
            MockPackageStore::new(),
            MockHealthReporter::new(),
        );
        let outcome = orch
            .orchestrate_upgrade(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            OrchestrationOutcome::Abandoned {
                error_code: "InvalidTarget".into()
            }
        );

        let after = load(&store).await;
        assert!(after.target_csm_config.is_none());
        let detail = store
            .load::<ConfigUpgradeErrorDetail>()
            .await
            .unwrap()
            .unwrap()
            .value;
        assert_eq!(detail.error_code.as_deref(), Some("InvalidTarget"));
        assert!(raw.raw("code-upgrade-detail").is_some());
    }

    #[tokio::test]
    async fn story_package_failure_abandons_code_upgrade() {
        let (_, store) = memory_store();
        seed(&store, &ClusterResource::new("c1", csm("1.0", 3), wrp("5.0")).unwrap()).await;
        store
            .save(
                &CodeUpgradeDetail {
                    code_version: Some(v("6.0")),
                    is_user_initiated: true,
                },
                None,
            )
            .await
            .unwrap();

        let mut execution = MockExecutionService::new();
        execution
            .expect_list_provisioned_versions()
            .returning(|_| Ok(vec![]));
        let mut packages = MockPackageStore::new();
        packages
            .expect_download()
            .returning(|version, _| Err(Error::package(version.to_string(), "not published")));

        let orch = orchestrator(store.clone(), execution, packages, MockHealthReporter::new());
        let outcome = orch
            .orchestrate_upgrade(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            OrchestrationOutcome::Abandoned {
                error_code: "PackageFailure".into()
            }
        );

        let detail = store.load::<CodeUpgradeDetail>().await.unwrap().unwrap().value;
        assert_eq!(detail.code_version, None);
    }

    #[tokio::test]
    async fn system_services_are_resized_when_present() {
        let (_, store) = memory_store();
        let size = SystemServiceSize {
            target_replica_set_size: 5,
            min_replica_set_size: 3,
        };
        let mut execution = MockExecutionService::new();
        execution.expect_list_system_services().returning(move || {
            Ok(vec![
                SystemServiceInfo {
                    name: SYSTEM_SERVICES[0].to_string(),
                    size: SystemServiceSize {
                        target_replica_set_size: 3,
                        min_replica_set_size: 2,
                    },
                },
                SystemServiceInfo {
                    name: SYSTEM_SERVICES[1].to_string(),
                    size,
                },
            ])
        });
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        execution
            .expect_update_system_service()
            .withf(move |name, s| name == SYSTEM_SERVICES[0] && *s == size)
            .returning(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let orch = orchestrator(store, execution, MockPackageStore::new(), MockHealthReporter::new());
        orch.resize_system_services(size, &OrchestratorConfig::default())
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn story_lost_race_drops_the_write() {
        let (raw, store) = memory_store();
        seed(&store, &ClusterResource::new("c1", csm("1.0", 3), wrp("5.0")).unwrap()).await;

        let orch = orchestrator(
            store.clone(),
            MockExecutionService::new(),
            MockPackageStore::new(),
            MockHealthReporter::new(),
        );
        let mut ours = orch.load_resource().await.unwrap();

        let mut theirs = store.load::<ClusterResource>().await.unwrap().unwrap();
        theirs.value.set_target_wrp_config(wrp("6.0"));
        store.save_stored(&theirs).await.unwrap();

        ours.value.set_target_csm_config(csm("2.0", 3)).unwrap();
        assert!(!orch.persist(&mut ours).await.unwrap());

        let after = load(&store).await;
        assert!(after.target_csm_config.is_none());
        assert_eq!(after.target_wrp_config.unwrap().code_version, v("6.0"));
        assert!(raw.raw("cluster-resource").is_some());
    }
}
