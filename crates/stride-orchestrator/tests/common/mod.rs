//! Shared harness for the upgrade scenario tests
//!
//! `FakeExecutionService` plays the cluster: it accepts upgrades, walks
//! them to a scripted terminal state over a number of polls, and tracks
//! provisioned packages, node runtime status and system service sizes. Every
//! side effect is appended to an event log so tests can assert ordering.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use stride_cluster::config::PortRange;
use stride_cluster::{
    ClusterResource, CsmConfig, DeactivationIntent, FailureReason, NodeDescription,
    NodeTypeDescription, SystemServiceSize, UpgradeHealthPolicy, WrpConfig,
};
use stride_common::config::{OrchestratorConfig, StaticConfigSource};
use stride_common::error::ExecutionErrorCode;
use stride_common::retry::RetryConfig;
use stride_common::{CodeVersion, Error, Result};
use stride_orchestrator::health::ChannelHealthReporter;
use stride_orchestrator::orchestrator::SYSTEM_SERVICES;
use stride_orchestrator::{
    Context, ExecutionService, FilePackageStore, HealthReport, NodeInfo, NodeRuntimeStatus,
    StartUpgradeRequest, SystemServiceInfo, UpgradeOrchestrator, UpgradeProgress, UpgradeState,
};
use stride_store::{MemoryStore, StoreManager};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub fn v(s: &str) -> CodeVersion {
    s.parse().unwrap()
}

pub fn node_type() -> NodeTypeDescription {
    NodeTypeDescription {
        name: "primary".to_string(),
        client_connection_endpoint_port: 19000,
        cluster_connection_endpoint_port: 19001,
        lease_driver_endpoint_port: 19002,
        service_connection_endpoint_port: 19003,
        http_gateway_endpoint_port: Some(19080),
        application_ports: PortRange {
            start_port: 20000,
            end_port: 30000,
        },
        ephemeral_ports: PortRange {
            start_port: 49152,
            end_port: 65534,
        },
        is_primary: true,
        placement_properties: BTreeMap::new(),
    }
}

pub fn node(i: usize) -> NodeDescription {
    NodeDescription {
        node_name: format!("vm{}", i),
        ip_address: format!("10.0.0.{}", i + 10),
        node_type_ref: "primary".to_string(),
        fault_domain: format!("fd:/dc1/r{}", i),
        upgrade_domain: format!("UD{}", i),
    }
}

pub fn csm(version: &str, node_count: usize) -> CsmConfig {
    CsmConfig {
        version: version.to_string(),
        nodes: (0..node_count).map(node).collect(),
        node_types: vec![node_type()],
        settings: vec![],
        upgrade_policy: UpgradeHealthPolicy::default(),
    }
}

pub fn wrp(code: &str) -> WrpConfig {
    WrpConfig {
        version: format!("wrp-{}", code),
        code_version: v(code),
        is_user_initiated: false,
        settings: vec![],
    }
}

/// How the fake ends an accepted upgrade
#[derive(Clone, Copy, Debug)]
pub enum Script {
    Complete,
    RollBack(FailureReason),
}

pub struct FakeState {
    pub progress: UpgradeProgress,
    pub polls_to_finish: u32,
    remaining: u32,
    pub script: Script,
    pub provisioned: BTreeSet<CodeVersion>,
    pub nodes: BTreeMap<String, NodeRuntimeStatus>,
    pub stuck_deactivation: bool,
    pub services: Vec<SystemServiceInfo>,
    pub starts: Vec<StartUpgradeRequest>,
    pub events: Vec<String>,
}

pub struct FakeExecutionService {
    pub state: Mutex<FakeState>,
}

impl FakeExecutionService {
    /// A cluster of `node_count` nodes that completed an upgrade to `code`/`config`
    pub fn running(code: &str, config: &str, node_count: usize) -> Self {
        let size = SystemServiceSize {
            target_replica_set_size: 5,
            min_replica_set_size: 3,
        };
        Self {
            state: Mutex::new(FakeState {
                progress: UpgradeProgress {
                    upgrade_state: UpgradeState::RollingForwardCompleted,
                    target_code_version: v(code),
                    target_config_version: config.to_string(),
                    failure_reason: None,
                    failure_timestamp: None,
                },
                polls_to_finish: 2,
                remaining: 0,
                script: Script::Complete,
                provisioned: BTreeSet::from([v(code)]),
                nodes: (0..node_count)
                    .map(|i| (format!("vm{}", i), NodeRuntimeStatus::Up))
                    .collect(),
                stuck_deactivation: false,
                services: SYSTEM_SERVICES
                    .iter()
                    .take(2)
                    .map(|name| SystemServiceInfo {
                        name: name.to_string(),
                        size,
                    })
                    .collect(),
                starts: Vec::new(),
                events: Vec::new(),
            }),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().starts.len()
    }

    /// Pretend an upgrade toward `code`/`config` was accepted before a failover
    pub fn in_flight(&self, code: &str, config: &str) {
        let mut state = self.state.lock();
        state.progress = UpgradeProgress {
            upgrade_state: UpgradeState::RollingForwardInProgress,
            target_code_version: v(code),
            target_config_version: config.to_string(),
            failure_reason: None,
            failure_timestamp: None,
        };
        state.remaining = state.polls_to_finish;
    }
}

#[async_trait]
impl ExecutionService for FakeExecutionService {
    async fn start_upgrade(&self, request: &StartUpgradeRequest) -> Result<()> {
        let mut state = self.state.lock();
        if !request.manifest_path.exists() {
            return Err(Error::execution(
                "start_upgrade",
                ExecutionErrorCode::InvalidArgument,
                "manifest file is missing",
            ));
        }
        if !state.provisioned.contains(&request.code_version) {
            return Err(Error::execution(
                "start_upgrade",
                ExecutionErrorCode::NotFound,
                format!("version {} is not provisioned", request.code_version),
            ));
        }
        state.events.push(format!(
            "start {} {}",
            request.code_version, request.config_version
        ));
        state.starts.push(request.clone());
        state.progress = UpgradeProgress {
            upgrade_state: UpgradeState::RollingForwardInProgress,
            target_code_version: request.code_version.clone(),
            target_config_version: request.config_version.clone(),
            failure_reason: None,
            failure_timestamp: None,
        };
        state.remaining = state.polls_to_finish;
        Ok(())
    }

    async fn get_upgrade_progress(&self) -> Result<UpgradeProgress> {
        let mut state = self.state.lock();
        if state.progress.upgrade_state == UpgradeState::RollingForwardInProgress {
            if state.remaining == 0 {
                match state.script {
                    Script::Complete => {
                        state.progress.upgrade_state = UpgradeState::RollingForwardCompleted;
                    }
                    Script::RollBack(reason) => {
                        state.progress.upgrade_state = UpgradeState::RollingBackCompleted;
                        state.progress.failure_reason = Some(reason);
                        state.progress.failure_timestamp = Some(Utc::now());
                    }
                }
            } else {
                state.remaining -= 1;
            }
        }
        Ok(state.progress.clone())
    }

    async fn provision(&self, code_version: &CodeVersion, package_path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        if !package_path.exists() {
            return Err(Error::execution(
                "provision",
                ExecutionErrorCode::InvalidArgument,
                format!("{} does not exist", package_path.display()),
            ));
        }
        state.events.push(format!("provision {}", code_version));
        state.provisioned.insert(code_version.clone());
        Ok(())
    }

    async fn unprovision(&self, code_version: &CodeVersion) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(format!("unprovision {}", code_version));
        state.provisioned.remove(code_version);
        Ok(())
    }

    async fn list_provisioned_versions(
        &self,
        code_version: Option<CodeVersion>,
    ) -> Result<Vec<CodeVersion>> {
        let state = self.state.lock();
        Ok(state
            .provisioned
            .iter()
            .filter(|p| code_version.as_ref().map(|c| c == *p).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn deactivate_node(&self, node_name: &str, _intent: DeactivationIntent) -> Result<()> {
        let mut state = self.state.lock();
        let stuck = state.stuck_deactivation;
        let Some(status) = state.nodes.get_mut(node_name) else {
            return Err(Error::execution(
                "deactivate_node",
                ExecutionErrorCode::NotFound,
                format!("node {} not found", node_name),
            ));
        };
        *status = if stuck {
            NodeRuntimeStatus::Disabling
        } else {
            NodeRuntimeStatus::Disabled
        };
        state.events.push(format!("deactivate {}", node_name));
        Ok(())
    }

    async fn activate_node(&self, node_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.nodes.insert(node_name.to_string(), NodeRuntimeStatus::Up);
        state.events.push(format!("activate {}", node_name));
        Ok(())
    }

    async fn remove_node_state(&self, node_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.nodes.remove(node_name);
        state.events.push(format!("remove_state {}", node_name));
        Ok(())
    }

    async fn get_node_list(&self) -> Result<Vec<NodeInfo>> {
        let state = self.state.lock();
        Ok(state
            .nodes
            .iter()
            .map(|(name, status)| NodeInfo {
                name: name.clone(),
                status: *status,
                fault_domain: "fd:/dc1".to_string(),
                upgrade_domain: "UD0".to_string(),
                address: "10.0.0.1".to_string(),
            })
            .collect())
    }

    async fn list_system_services(&self) -> Result<Vec<SystemServiceInfo>> {
        Ok(self.state.lock().services.clone())
    }

    async fn update_system_service(
        &self,
        service_name: &str,
        size: SystemServiceSize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let Some(service) = state.services.iter_mut().find(|s| s.name == service_name) else {
            return Err(Error::execution(
                "update_system_service",
                ExecutionErrorCode::NotFound,
                format!("service {} not found", service_name),
            ));
        };
        service.size = size;
        state.events.push(format!(
            "resize {} {}",
            service_name, size.target_replica_set_size
        ));
        Ok(())
    }
}

/// A cluster harness: store, fake execution service, package repository
pub struct Harness {
    pub store: StoreManager,
    pub raw: Arc<MemoryStore>,
    pub execution: Arc<FakeExecutionService>,
    pub orchestrator: UpgradeOrchestrator,
    pub health: mpsc::Receiver<HealthReport>,
    pub repository: TempDir,
    _downloads: TempDir,
}

pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        upgrade_poll_interval_secs: 1,
        node_poll_interval_secs: 1,
        deactivation_timeout_secs: 30,
        activation_timeout_secs: 30,
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        },
        ..Default::default()
    }
}

pub fn write_package(dir: &Path, version: &str) -> PathBuf {
    let path = dir.join(format!("{}.json", version));
    let package = serde_json::json!({
        "version": version,
        "configuration": {"version": format!("wrp-{}", version)}
    });
    std::fs::write(&path, package.to_string()).unwrap();
    path
}

impl Harness {
    /// A seeded cluster of `node_count` nodes running `code` at config `1.0`
    pub async fn new(code: &str, node_count: usize, config: OrchestratorConfig) -> Self {
        let raw = Arc::new(MemoryStore::new());
        let store = StoreManager::new(raw.clone(), config.retry.clone());
        let resource = ClusterResource::new("c1", csm("1.0", node_count), wrp(code)).unwrap();
        let running_config = resource.current.external_state.config_version().to_string();
        store.save(&resource, None).await.unwrap();

        let execution = Arc::new(FakeExecutionService::running(
            code,
            &running_config,
            node_count,
        ));
        let repository = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        write_package(repository.path(), code);
        let packages =
            Arc::new(FilePackageStore::new(repository.path(), downloads.path()).unwrap());
        let (health, receiver) = ChannelHealthReporter::new(64);

        let ctx = Context::builder(store.clone(), execution.clone(), packages)
            .health(Arc::new(health))
            .config_source(Arc::new(StaticConfigSource(config)))
            .build();

        Self {
            store,
            raw,
            execution,
            orchestrator: UpgradeOrchestrator::new(Arc::new(ctx)),
            health: receiver,
            repository,
            _downloads: downloads,
        }
    }

    pub async fn resource(&self) -> ClusterResource {
        self.store
            .load::<ClusterResource>()
            .await
            .unwrap()
            .unwrap()
            .value
    }

    pub fn health_reports(&mut self) -> Vec<HealthReport> {
        let mut reports = Vec::new();
        while let Ok(report) = self.health.try_recv() {
            reports.push(report);
        }
        reports
    }
}
