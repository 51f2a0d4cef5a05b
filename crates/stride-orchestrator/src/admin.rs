//! Request-facing operations: upgrade requests, status and configuration
//!
//! These only record intent in the store. The control loop turns recorded
//! intent into upgrades on its next iteration; an optional wake handle
//! shortens the wait.

use std::sync::Arc;

use serde::Serialize;
use stride_cluster::document::{parse_config_document, to_config_document, DEFAULT_API_VERSION};
use stride_cluster::{
    ClusterResource, CodeUpgradeDetail, ConfigUpgradeErrorDetail, UpgradeFailure, UpgradeFlow,
    WrpConfig,
};
use stride_common::{CodeVersion, Error, Result};
use stride_goalstate::{validate_requested_version, GoalStateModel};
use stride_store::{Record, StoreManager};
use tokio::sync::Notify;
use tracing::info;

/// Coarse state of the cluster as seen by an operator
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum ClusterUpgradeState {
    /// Nothing in flight
    Idle,
    /// Nodes are being deactivated ahead of their removal
    NodesDisabling,
    /// An upgrade attempt is in flight
    UpgradeInProgress,
}

/// Snapshot of the cluster's upgrade status
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStatus {
    /// Cluster identifier
    pub cluster_id: String,
    /// Coarse state
    pub state: ClusterUpgradeState,
    /// Code version currently applied
    pub current_code_version: CodeVersion,
    /// Config version currently applied
    pub current_config_version: String,
    /// Code version of the in-flight upgrade
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_code_version: Option<CodeVersion>,
    /// Config version of the in-flight upgrade
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_config_version: Option<String>,
    /// Flow of the in-flight upgrade
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_flow: Option<UpgradeFlow>,
    /// Requested code version not yet picked up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_code_version: Option<CodeVersion>,
    /// Requested configuration version not yet picked up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_config_version: Option<String>,
    /// Nodes waiting for deactivation
    pub disabling_nodes: Vec<String>,
    /// Last rolled back or failed attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<UpgradeFailure>,
    /// Error recorded by the last abandoned attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ConfigUpgradeErrorDetail>,
}

/// Administrative operations over the persisted records
pub struct AdminService {
    store: StoreManager,
    wake: Option<Arc<Notify>>,
}

impl AdminService {
    /// Service over `store`
    pub fn new(store: StoreManager) -> Self {
        Self { store, wake: None }
    }

    /// Wake the control loop after every accepted request
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Seed the cluster resource from a configuration document
    ///
    /// Used on first deployment and to recover from lost state. Fails with a
    /// conflict if a resource already exists.
    ///
    /// # Arguments
    ///
    /// * `cluster_id` - Identifier recorded in the resource
    /// * `document` - JSON configuration document the cluster runs
    /// * `wrp` - Admin configuration of the running code package
    pub async fn initialize(
        &self,
        cluster_id: &str,
        document: &str,
        wrp: WrpConfig,
    ) -> Result<ClusterResource> {
        let csm = parse_config_document(document)?;
        let resource = ClusterResource::new(cluster_id, csm, wrp)?;
        self.store.save(&resource, None).await?;
        info!(
            cluster = %cluster_id,
            code_version = %resource.current.wrp_config.code_version,
            config_version = %resource.current.csm_config.version,
            "cluster resource initialized"
        );
        Ok(resource)
    }

    /// Request a configuration upgrade
    ///
    /// Rejected while an upgrade is in flight. A concurrent write surfaces
    /// as a conflict; the caller decides whether to resubmit.
    pub async fn start_configuration_upgrade(&self, document: &str) -> Result<()> {
        let csm = parse_config_document(document)?;
        let mut stored = self.load_resource().await?;
        if stored.value.has_pending() {
            return Err(Error::validation(
                "an upgrade is in progress; retry once it has finished",
            ));
        }
        if csm == stored.value.current.csm_config && stored.value.target_csm_config.is_none() {
            return Err(Error::validation(format!(
                "cluster already runs configuration version {}",
                csm.version
            )));
        }

        let version = csm.version.clone();
        stored.value.set_target_csm_config(csm)?;
        self.store.save_stored(&stored).await?;
        info!(version = %version, "configuration upgrade requested");
        self.notify();
        Ok(())
    }

    /// Request a code upgrade to `version`
    ///
    /// With a goal-state manifest the request must name an eligible
    /// published version.
    pub async fn start_code_upgrade(
        &self,
        version: CodeVersion,
        model: Option<&GoalStateModel>,
    ) -> Result<()> {
        let resource = self.load_resource().await?.value;
        let current = &resource.current.wrp_config.code_version;
        match model {
            Some(model) => {
                let change = validate_requested_version(current, &version, model)?;
                info!(from = %current, to = %version, change = ?change, "code version change validated");
            }
            None if version == *current => {
                return Err(Error::validation(format!(
                    "cluster already runs version {}",
                    version
                )));
            }
            None => {}
        }

        self.store
            .update::<CodeUpgradeDetail, _>(|d| {
                *d = CodeUpgradeDetail {
                    code_version: Some(version.clone()),
                    is_user_initiated: true,
                }
            })
            .await?;
        info!(version = %version, "code upgrade requested");
        self.notify();
        Ok(())
    }

    /// Current upgrade status
    pub async fn get_upgrade_status(&self) -> Result<UpgradeStatus> {
        let resource = self.load_resource().await?.value;
        let detail = self
            .store
            .load::<CodeUpgradeDetail>()
            .await?
            .map(|s| s.value)
            .unwrap_or_default();
        let error = self
            .store
            .load::<ConfigUpgradeErrorDetail>()
            .await?
            .map(|s| s.value)
            .filter(|e| !e.is_empty());

        let disabling: Vec<String> = resource
            .disabling_nodes()
            .into_iter()
            .map(|n| n.node_name)
            .collect();
        let state = if resource.has_pending() {
            ClusterUpgradeState::UpgradeInProgress
        } else if !disabling.is_empty() {
            ClusterUpgradeState::NodesDisabling
        } else {
            ClusterUpgradeState::Idle
        };

        Ok(UpgradeStatus {
            cluster_id: resource.cluster_id.clone(),
            state,
            current_code_version: resource.current.external_state.code_version.clone(),
            current_config_version: resource.current.external_state.config_version().to_string(),
            pending_code_version: resource.pending.as_ref().map(|p| p.code_version().clone()),
            pending_config_version: resource
                .pending
                .as_ref()
                .map(|p| p.config_version().to_string()),
            pending_flow: resource.pending.as_ref().map(|p| p.flow),
            requested_code_version: detail.code_version,
            target_config_version: resource.target_csm_config.as_ref().map(|c| c.version.clone()),
            disabling_nodes: disabling,
            last_failure: resource.last_failure.clone(),
            error,
        })
    }

    /// The applied configuration as a document of `api_version`
    pub async fn get_current_configuration(&self, api_version: Option<&str>) -> Result<String> {
        let resource = self.load_resource().await?.value;
        to_config_document(
            &resource.current.csm_config,
            &resource.cluster_id,
            api_version.unwrap_or(DEFAULT_API_VERSION),
        )
    }

    async fn load_resource(&self) -> Result<stride_store::Stored<ClusterResource>> {
        self.store
            .load::<ClusterResource>()
            .await?
            .ok_or_else(|| Error::not_found(ClusterResource::KIND, ClusterResource::KEY))
    }

    fn notify(&self) {
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_store, v, wrp};
    use stride_goalstate::PackageDetails;

    const DOC: &str = r#"{
        "apiVersion": "10-2017",
        "name": "prod",
        "clusterConfigurationVersion": "1.0",
        "nodes": [
            {"nodeName": "vm0", "iPAddress": "10.0.0.4", "nodeTypeRef": "front", "faultDomain": "fd:/r0", "upgradeDomain": "UD0"},
            {"nodeName": "vm1", "iPAddress": "10.0.0.5", "nodeTypeRef": "front", "faultDomain": "fd:/r1", "upgradeDomain": "UD1"},
            {"nodeName": "vm2", "iPAddress": "10.0.0.6", "nodeTypeRef": "front", "faultDomain": "fd:/r2", "upgradeDomain": "UD2"}
        ],
        "properties": {
            "nodeTypes": [{
                "name": "front",
                "clientConnectionEndpointPort": 19000,
                "clusterConnectionEndpointPort": 19001,
                "leaseDriverEndpointPort": 19002,
                "serviceConnectionEndpointPort": 19003,
                "applicationPorts": {"startPort": 20000, "endPort": 30000},
                "ephemeralPorts": {"startPort": 49152, "endPort": 65534},
                "isPrimary": true
            }]
        }
    }"#;

    fn scaled_in() -> String {
        let mut doc: serde_json::Value = serde_json::from_str(DOC).unwrap();
        doc["clusterConfigurationVersion"] = "2.0".into();
        doc["nodes"].as_array_mut().unwrap().pop();
        doc.to_string()
    }

    async fn initialized() -> AdminService {
        let (_, store) = memory_store();
        let admin = AdminService::new(store);
        admin.initialize("prod", DOC, wrp("5.0")).await.unwrap();
        admin
    }

    fn package(version: &str, min: &str) -> PackageDetails {
        PackageDetails {
            version: v(version),
            min_version: v(min),
            is_upgrade_disabled: false,
            is_downgrade_disabled: false,
            support_expiry_date: None,
            is_goal_package: false,
            target_package_location: None,
        }
    }

    #[tokio::test]
    async fn initialize_refuses_to_overwrite() {
        let admin = initialized().await;
        let err = admin.initialize("prod", DOC, wrp("5.0")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn status_of_a_fresh_cluster_is_idle() {
        let admin = initialized().await;
        let status = admin.get_upgrade_status().await.unwrap();
        assert_eq!(status.state, ClusterUpgradeState::Idle);
        assert_eq!(status.current_code_version, v("5.0"));
        assert_eq!(status.current_config_version, "1.0-n1");
        assert!(status.error.is_none());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "Idle");
        assert!(json.get("pendingCodeVersion").is_none());
    }

    #[tokio::test]
    async fn story_scale_in_request_marks_nodes_disabling() {
        let wake = Arc::new(Notify::new());
        let admin = initialized().await.with_wake(wake.clone());

        admin.start_configuration_upgrade(&scaled_in()).await.unwrap();
        let status = admin.get_upgrade_status().await.unwrap();
        assert_eq!(status.state, ClusterUpgradeState::NodesDisabling);
        assert_eq!(status.disabling_nodes, vec!["vm2".to_string()]);
        assert_eq!(status.target_config_version.as_deref(), Some("2.0"));

        tokio::time::timeout(std::time::Duration::from_secs(1), wake.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unchanged_configuration_is_rejected() {
        let admin = initialized().await;
        let err = admin.start_configuration_upgrade(DOC).await.unwrap_err();
        assert!(err.to_string().contains("already runs"));
    }

    #[tokio::test]
    async fn requests_without_a_resource_are_not_found() {
        let (_, store) = memory_store();
        let admin = AdminService::new(store);
        assert!(matches!(
            admin.get_upgrade_status().await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn code_upgrade_is_validated_against_the_manifest() {
        let admin = initialized().await;
        let model = GoalStateModel {
            packages: vec![package("5.0", "4.0"), package("7.0", "6.0")],
        };

        assert!(admin
            .start_code_upgrade(v("7.0"), Some(&model))
            .await
            .is_err());
        assert!(admin.start_code_upgrade(v("5.0"), None).await.is_err());

        admin.start_code_upgrade(v("6.0"), None).await.unwrap();
        let status = admin.get_upgrade_status().await.unwrap();
        assert_eq!(status.requested_code_version, Some(v("6.0")));
    }

    #[tokio::test]
    async fn configuration_renders_in_the_requested_api_version() {
        let admin = initialized().await;
        let doc = admin
            .get_current_configuration(Some("04-2017"))
            .await
            .unwrap();
        assert!(doc.contains("\"apiVersion\": \"04-2017\""));
        assert!(admin.get_current_configuration(Some("01-1999")).await.is_err());
    }
}
