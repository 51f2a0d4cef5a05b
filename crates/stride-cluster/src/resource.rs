//! The persisted cluster resource and its upgrade state machine

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stride_common::{CodeVersion, Error, Result};
use stride_store::Record;
use tracing::{debug, info};

use crate::config::{CsmConfig, NodeDescription, UpgradeHealthPolicy, WrpConfig};
use crate::manifest::ClusterManifest;
use crate::node::{DeactivationIntent, NodeConfig, NodeState, NodeStatus};
use crate::reliability::{ReliabilityLevel, SystemServiceSize};

/// What the execution service is asked to converge to
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalState {
    /// Code version
    pub code_version: CodeVersion,
    /// Manifest; its version is the config version
    pub manifest: ClusterManifest,
}

impl ExternalState {
    /// Config version reported by the execution service for this state
    pub fn config_version(&self) -> &str {
        &self.manifest.version
    }
}

/// A complete, self-consistent cluster state
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    /// User configuration
    pub csm_config: CsmConfig,
    /// Admin configuration
    pub wrp_config: WrpConfig,
    /// Node membership
    pub node_config: NodeConfig,
    /// What the execution service runs
    pub external_state: ExternalState,
}

/// Kind of the in-flight upgrade
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "$type")]
pub enum UpgradeKind {
    /// Code and/or configuration change
    #[serde(rename = "Simple@2")]
    Simple,
    /// Membership change that moves the cluster to another reliability tier
    #[serde(rename = "AutoScale@2", rename_all = "camelCase")]
    AutoScale {
        /// System service size to apply once the upgrade completes
        target_system_services_size: SystemServiceSize,
    },
    /// Follow-up to an `AutoScale` upgrade that only resizes system services
    #[serde(rename = "ServiceResize@2", rename_all = "camelCase")]
    ServiceResize {
        /// System service size to apply
        target_system_services_size: SystemServiceSize,
    },
}

/// The kind of change an upgrade carries, as seen by fault injection and logs
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum UpgradeFlow {
    /// Code version changes
    CodeUpgrade,
    /// Configuration changes only
    ConfigUpgrade,
    /// Nodes are added
    ScaleOut,
    /// Nodes are removed
    ScaleIn,
}

impl std::fmt::Display for UpgradeFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CodeUpgrade => write!(f, "CodeUpgrade"),
            Self::ConfigUpgrade => write!(f, "ConfigUpgrade"),
            Self::ScaleOut => write!(f, "ScaleOut"),
            Self::ScaleIn => write!(f, "ScaleIn"),
        }
    }
}

impl std::str::FromStr for UpgradeFlow {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "codeupgrade" => Ok(Self::CodeUpgrade),
            "configupgrade" => Ok(Self::ConfigUpgrade),
            "scaleout" => Ok(Self::ScaleOut),
            "scalein" => Ok(Self::ScaleIn),
            _ => Err(Error::validation(format!(
                "invalid upgrade flow: {s}, expected one of: CodeUpgrade, ConfigUpgrade, ScaleOut, ScaleIn"
            ))),
        }
    }
}

/// An upgrade attempt in flight
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpgrade {
    /// Upgrade kind
    pub kind: UpgradeKind,
    /// Flow classification
    pub flow: UpgradeFlow,
    /// State the cluster moves to on success
    pub target: ClusterSnapshot,
    /// Health policy passed with the upgrade
    pub policy: UpgradeHealthPolicy,
    /// When the attempt was created
    pub started_at: DateTime<Utc>,
}

impl PendingUpgrade {
    /// Target code version
    pub fn code_version(&self) -> &CodeVersion {
        &self.target.external_state.code_version
    }

    /// Target config (manifest) version
    pub fn config_version(&self) -> &str {
        self.target.external_state.config_version()
    }
}

/// Why the last attempt did not roll forward, as reported by the execution service
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum FailureReason {
    /// No reason reported
    #[default]
    Unknown,
    /// Interrupted by another upgrade
    Interrupted,
    /// Health checks failed
    HealthCheck,
    /// An upgrade domain took too long
    UpgradeDomainTimeout,
    /// The whole upgrade took too long
    OverallUpgradeTimeout,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Interrupted => write!(f, "Interrupted"),
            Self::HealthCheck => write!(f, "HealthCheck"),
            Self::UpgradeDomainTimeout => write!(f, "UpgradeDomainTimeout"),
            Self::OverallUpgradeTimeout => write!(f, "OverallUpgradeTimeout"),
        }
    }
}

/// Record of the last rolled back or failed attempt
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeFailure {
    /// When the failure was observed
    pub timestamp: DateTime<Utc>,
    /// Reported reason
    pub reason: FailureReason,
}

/// The single persisted aggregate describing a cluster's upgrade state
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResource {
    /// Cluster identifier
    pub cluster_id: String,
    /// Last successfully applied state
    pub current: ClusterSnapshot,
    /// In-flight upgrade, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingUpgrade>,
    /// Desired user configuration not yet folded into a pending upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_csm_config: Option<CsmConfig>,
    /// Desired admin configuration not yet folded into a pending upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_wrp_config: Option<WrpConfig>,
    /// Desired node membership not yet folded into a pending upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_config: Option<NodeConfig>,
    /// Health policy derived for the next upgrade (node removal)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_policy: Option<UpgradeHealthPolicy>,
    /// Every machine known to the cluster, including ones being removed
    pub topology: BTreeMap<String, NodeDescription>,
    /// Last rolled back or failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<UpgradeFailure>,
}

impl Record for ClusterResource {
    const KEY: &'static str = "cluster-resource";
    const KIND: &'static str = "ClusterResource";
}

impl ClusterResource {
    /// Seed a resource for a cluster already running `csm` at `wrp`
    pub fn new(cluster_id: impl Into<String>, csm: CsmConfig, wrp: WrpConfig) -> Result<Self> {
        csm.validate()?;
        let topology: BTreeMap<String, NodeDescription> = csm
            .nodes
            .iter()
            .map(|n| (n.node_name.clone(), n.clone()))
            .collect();
        let node_config = NodeConfig {
            version: 1,
            nodes_status: csm
                .nodes
                .iter()
                .map(|n| NodeStatus::enabled(&n.node_name, &n.node_type_ref))
                .collect(),
        };
        let manifest = ClusterManifest::generate(&csm, &wrp, &node_config, &topology);
        Ok(Self {
            cluster_id: cluster_id.into(),
            current: ClusterSnapshot {
                external_state: ExternalState {
                    code_version: wrp.code_version.clone(),
                    manifest,
                },
                csm_config: csm,
                wrp_config: wrp,
                node_config,
            },
            pending: None,
            target_csm_config: None,
            target_wrp_config: None,
            target_node_config: None,
            target_policy: None,
            topology,
            last_failure: None,
        })
    }

    /// True if an upgrade attempt is in flight
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Nodes being removed: from the target node config if set, else current
    pub fn disabling_nodes(&self) -> Vec<NodeStatus> {
        self.target_node_config
            .as_ref()
            .unwrap_or(&self.current.node_config)
            .disabling()
    }

    /// Nodes removed by the last completed upgrade
    pub fn removed_nodes(&self) -> Vec<NodeStatus> {
        self.current.node_config.removed()
    }

    /// Nodes the pending upgrade adds to the cluster
    pub fn added_nodes(&self) -> Vec<NodeDescription> {
        let Some(pending) = &self.pending else {
            return Vec::new();
        };
        pending
            .target
            .node_config
            .nodes_status
            .iter()
            .filter(|n| n.node_state == NodeState::Enabled)
            .filter(|n| self.current.node_config.node(&n.node_name).is_none())
            .filter_map(|n| self.topology.get(&n.node_name).cloned())
            .collect()
    }

    /// Record a new desired user configuration
    ///
    /// Nodes that left the configuration become `Disabling`; new nodes are
    /// added as `Enabled` and bump the node config version.
    pub fn set_target_csm_config(&mut self, csm: CsmConfig) -> Result<()> {
        csm.validate()?;

        let mut node_config = self
            .target_node_config
            .as_ref()
            .unwrap_or(&self.current.node_config)
            .without_removed();
        let desired: BTreeSet<&str> = csm.nodes.iter().map(|n| n.node_name.as_str()).collect();

        for status in node_config.nodes_status.iter_mut() {
            let wanted = desired.contains(status.node_name.as_str());
            match (status.node_state, wanted) {
                (NodeState::Enabled, false) => {
                    status.node_state = NodeState::Disabling;
                    status.deactivation_intent = DeactivationIntent::RemoveNode;
                }
                (NodeState::Disabling, true) => {
                    return Err(Error::validation(format!(
                        "node '{}' is being removed and cannot be added back yet",
                        status.node_name
                    )));
                }
                _ => {}
            }
        }

        let mut added = 0;
        for node in &csm.nodes {
            if node_config.node(&node.node_name).is_none() {
                node_config
                    .nodes_status
                    .push(NodeStatus::enabled(&node.node_name, &node.node_type_ref));
                added += 1;
            }
        }
        if added > 0 {
            node_config.version += 1;
        }

        for node in &csm.nodes {
            self.topology.insert(node.node_name.clone(), node.clone());
        }

        info!(
            cluster = %self.cluster_id,
            version = %csm.version,
            added,
            disabling = node_config.disabling().len(),
            "target configuration recorded"
        );
        self.target_csm_config = Some(csm);
        self.target_node_config = Some(node_config);
        Ok(())
    }

    /// Record a new desired admin configuration
    pub fn set_target_wrp_config(&mut self, wrp: WrpConfig) {
        self.target_wrp_config = Some(wrp);
    }

    /// Derive a pending upgrade from the targets
    ///
    /// Returns `Ok(true)` if a new pending upgrade was created. Returns
    /// `Ok(false)` when an upgrade is already in flight, nothing material
    /// changed, or nodes are still waiting for deactivation. A malformed
    /// target is an [`Error::InvalidTarget`].
    pub fn run_state_machine(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(false);
        }

        let csm = self
            .target_csm_config
            .clone()
            .unwrap_or_else(|| self.current.csm_config.clone());
        let wrp = self
            .target_wrp_config
            .clone()
            .unwrap_or_else(|| self.current.wrp_config.clone());
        let node_config = self
            .target_node_config
            .clone()
            .unwrap_or_else(|| self.current.node_config.clone());

        self.validate_target(&csm, &node_config)?;

        if !node_config.disabling().is_empty() {
            debug!(cluster = %self.cluster_id, "nodes awaiting deactivation, no upgrade started");
            return Ok(false);
        }

        let current = &self.current;
        let code_changed = wrp.code_version != current.wrp_config.code_version;
        let changed = code_changed
            || wrp.version != current.wrp_config.version
            || wrp.settings != current.wrp_config.settings
            || csm != current.csm_config
            || node_config.version != current.node_config.version;
        if !changed {
            return Ok(false);
        }

        let current_members = current.node_config.member_count();
        let target_members = node_config.member_count();
        let flow = if code_changed {
            UpgradeFlow::CodeUpgrade
        } else if target_members > current_members {
            UpgradeFlow::ScaleOut
        } else if target_members < current_members || !node_config.removed().is_empty() {
            UpgradeFlow::ScaleIn
        } else {
            UpgradeFlow::ConfigUpgrade
        };

        let current_tier = ReliabilityLevel::for_node_count(primary_members(&current.csm_config, &current.node_config, &self.topology));
        let target_tier = ReliabilityLevel::for_node_count(primary_members(&csm, &node_config, &self.topology));
        let kind = if current_tier != target_tier {
            UpgradeKind::AutoScale {
                target_system_services_size: target_tier.system_service_size(),
            }
        } else {
            UpgradeKind::Simple
        };

        let manifest = ClusterManifest::generate(&csm, &wrp, &node_config, &self.topology);
        let policy = self
            .target_policy
            .clone()
            .unwrap_or_else(|| csm.upgrade_policy.clone());

        info!(
            cluster = %self.cluster_id,
            flow = %flow,
            code_version = %wrp.code_version,
            config_version = %manifest.version,
            "pending upgrade created"
        );

        self.pending = Some(PendingUpgrade {
            kind,
            flow,
            target: ClusterSnapshot {
                external_state: ExternalState {
                    code_version: wrp.code_version.clone(),
                    manifest,
                },
                csm_config: csm,
                wrp_config: wrp,
                node_config,
            },
            policy,
            started_at: now,
        });
        Ok(true)
    }

    fn validate_target(&self, csm: &CsmConfig, node_config: &NodeConfig) -> Result<()> {
        csm.validate()
            .map_err(|e| Error::invalid_target(format!("user configuration: {}", e)))?;

        let mut seen = BTreeSet::new();
        for status in &node_config.nodes_status {
            if !seen.insert(status.node_name.as_str()) {
                return Err(Error::invalid_target(format!(
                    "node '{}' appears twice in node configuration",
                    status.node_name
                )));
            }
            if status.node_state == NodeState::Removed {
                continue;
            }
            if !self.topology.contains_key(&status.node_name) {
                return Err(Error::invalid_target(format!(
                    "node '{}' has no topology entry",
                    status.node_name
                )));
            }
            if csm.node_type(&status.node_type).is_none() {
                return Err(Error::invalid_target(format!(
                    "node '{}' references undeclared node type '{}'",
                    status.node_name, status.node_type
                )));
            }
        }
        if node_config.version < self.current.node_config.version {
            return Err(Error::invalid_target(format!(
                "node configuration version {} is older than current {}",
                node_config.version, self.current.node_config.version
            )));
        }
        Ok(())
    }

    /// Fold the pending upgrade into `current`
    ///
    /// An `AutoScale` upgrade is followed by a `ServiceResize` pending that
    /// carries the system service size. Removed nodes leave the topology.
    pub fn cluster_upgrade_completed(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        for removed in pending.target.node_config.removed() {
            self.topology.remove(&removed.node_name);
        }

        info!(
            cluster = %self.cluster_id,
            code_version = %pending.code_version(),
            config_version = %pending.config_version(),
            "upgrade completed"
        );

        self.current = pending.target.clone();
        self.last_failure = None;

        if let UpgradeKind::AutoScale {
            target_system_services_size,
        } = pending.kind
        {
            self.pending = Some(PendingUpgrade {
                kind: UpgradeKind::ServiceResize {
                    target_system_services_size,
                },
                ..pending
            });
        }
    }

    /// Record a rolled back or failed attempt and drop the pending upgrade
    pub fn cluster_upgrade_rolled_back_or_failed(
        &mut self,
        timestamp: DateTime<Utc>,
        reason: FailureReason,
    ) {
        if let Some(pending) = self.pending.take() {
            info!(
                cluster = %self.cluster_id,
                code_version = %pending.code_version(),
                reason = %reason,
                "upgrade rolled back or failed"
            );
        }
        self.last_failure = Some(UpgradeFailure { timestamp, reason });
    }

    /// Discard targets that have not been committed
    pub fn reset(&mut self) {
        self.target_csm_config = None;
        self.target_wrp_config = None;
        self.target_node_config = None;
        self.target_policy = None;
        let known: BTreeSet<String> = self
            .current
            .node_config
            .nodes_status
            .iter()
            .filter(|n| n.node_state != NodeState::Removed)
            .map(|n| n.node_name.clone())
            .collect();
        self.topology.retain(|name, _| known.contains(name));
    }

    /// Turn confirmed-deactivated `Disabling` nodes into a removal target
    ///
    /// Marks the nodes `Removed`, bumps the node config version to
    /// `node_config_version + 1` and derives unhealthy-node thresholds that
    /// tolerate their absence. The nodes keep their topology entries until
    /// the removal upgrade completes. Returns false if none of `nodes` was
    /// disabling.
    pub fn set_target_node_config_for_removed_nodes(
        &mut self,
        nodes: &[NodeStatus],
        node_config_version: u64,
    ) -> bool {
        let mut node_config = self
            .target_node_config
            .clone()
            .unwrap_or_else(|| self.current.node_config.clone())
            .without_removed();
        let names: BTreeSet<&str> = nodes.iter().map(|n| n.node_name.as_str()).collect();

        let csm = self
            .target_csm_config
            .clone()
            .unwrap_or_else(|| self.current.csm_config.clone());
        let policy = removal_policy(&csm.upgrade_policy, &node_config, &names, &self.topology);

        let mut marked = 0;
        for status in node_config.nodes_status.iter_mut() {
            if status.node_state == NodeState::Disabling && names.contains(status.node_name.as_str()) {
                status.node_state = NodeState::Removed;
                status.deactivation_intent = DeactivationIntent::RemoveNode;
                status.instance_id = 0;
                marked += 1;
            }
        }
        if marked == 0 {
            return false;
        }

        node_config.version = node_config_version + 1;

        info!(
            cluster = %self.cluster_id,
            removed = marked,
            node_config_version = node_config.version,
            "removal target recorded"
        );
        self.target_node_config = Some(node_config);
        self.target_csm_config = Some(csm);
        self.target_policy = Some(policy);
        true
    }
}

fn primary_members(
    csm: &CsmConfig,
    node_config: &NodeConfig,
    topology: &BTreeMap<String, NodeDescription>,
) -> usize {
    node_config
        .nodes_status
        .iter()
        .filter(|n| n.node_state != NodeState::Removed)
        .filter(|n| topology.contains_key(&n.node_name))
        .filter(|n| csm.node_type(&n.node_type).map(|t| t.is_primary).unwrap_or(false))
        .count()
}

/// Health thresholds for an upgrade that removes `removing`
///
/// Explicitly configured thresholds win; unset (zero) ones are derived from
/// the share of removed nodes overall and within the worst upgrade domain.
fn removal_policy(
    base: &UpgradeHealthPolicy,
    node_config: &NodeConfig,
    removing: &BTreeSet<&str>,
    topology: &BTreeMap<String, NodeDescription>,
) -> UpgradeHealthPolicy {
    let members: Vec<&NodeStatus> = node_config
        .nodes_status
        .iter()
        .filter(|n| n.node_state != NodeState::Removed)
        .collect();
    let total = members.len();
    let removed = members
        .iter()
        .filter(|n| removing.contains(n.node_name.as_str()))
        .count();

    let mut per_domain: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for member in &members {
        let domain = topology
            .get(&member.node_name)
            .map(|d| d.upgrade_domain.as_str())
            .unwrap_or("");
        let entry = per_domain.entry(domain).or_default();
        entry.0 += 1;
        if removing.contains(member.node_name.as_str()) {
            entry.1 += 1;
        }
    }

    let overall = percent(removed, total);
    let worst_domain = per_domain
        .values()
        .map(|(count, removing)| percent(*removing, *count))
        .max()
        .unwrap_or(0);

    let mut policy = base.clone();
    if policy.max_percent_unhealthy_nodes == 0 {
        policy.max_percent_unhealthy_nodes = overall;
    }
    if policy.max_percent_delta_unhealthy_nodes == 0 {
        policy.max_percent_delta_unhealthy_nodes = overall;
    }
    if policy.max_percent_upgrade_domain_delta_unhealthy_nodes == 0 {
        policy.max_percent_upgrade_domain_delta_unhealthy_nodes = worst_domain;
    }
    policy
}

fn percent(part: usize, whole: usize) -> u8 {
    if whole == 0 {
        return 0;
    }
    ((part * 100).div_ceil(whole)).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::{csm, wrp};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn resource(nodes: usize) -> ClusterResource {
        ClusterResource::new("c1", csm("1.0", nodes), wrp("5.0")).unwrap()
    }

    mod state_machine {
        use super::*;

        #[test]
        fn story_unchanged_targets_are_idempotent() {
            let mut r = resource(5);
            assert!(!r.run_state_machine(now()).unwrap());
            assert!(r.pending.is_none());

            r.set_target_wrp_config(r.current.wrp_config.clone());
            r.target_csm_config = Some(r.current.csm_config.clone());
            assert!(!r.run_state_machine(now()).unwrap());
            assert!(!r.run_state_machine(now()).unwrap());
            assert!(r.pending.is_none());
        }

        #[test]
        fn story_code_upgrade_creates_pending() {
            let mut r = resource(5);
            r.set_target_wrp_config(wrp("6.0"));

            assert!(r.run_state_machine(now()).unwrap());
            let pending = r.pending.as_ref().unwrap();
            assert_eq!(pending.code_version().to_string(), "6.0");
            assert_eq!(pending.flow, UpgradeFlow::CodeUpgrade);
            assert_eq!(pending.kind, UpgradeKind::Simple);
            assert_eq!(pending.config_version(), "1.0-n1");

            // A second run leaves the in-flight upgrade alone
            assert!(!r.run_state_machine(now()).unwrap());
        }

        #[test]
        fn story_malformed_target_is_an_error() {
            let mut r = resource(3);
            let mut bad = csm("2.0", 3);
            bad.nodes[0].node_type_ref = "ghost".into();
            r.target_csm_config = Some(bad);

            let err = r.run_state_machine(now()).unwrap_err();
            assert!(matches!(err, Error::InvalidTarget { .. }));
            assert!(r.pending.is_none());
        }

        #[test]
        fn story_disabling_nodes_do_not_start_an_upgrade() {
            let mut r = resource(5);
            r.set_target_csm_config(csm("2.0", 4)).unwrap();

            assert_eq!(r.disabling_nodes().len(), 1);
            assert_eq!(r.disabling_nodes()[0].node_name, "vm4");
            assert!(!r.run_state_machine(now()).unwrap());
            assert!(r.pending.is_none());
        }

        #[test]
        fn story_adding_nodes_changes_tier_and_autoscales() {
            let mut r = resource(3);
            r.set_target_csm_config(csm("2.0", 5)).unwrap();
            assert_eq!(r.target_node_config.as_ref().unwrap().version, 2);

            assert!(r.run_state_machine(now()).unwrap());
            let pending = r.pending.clone().unwrap();
            assert_eq!(pending.flow, UpgradeFlow::ScaleOut);
            assert_eq!(
                pending.kind,
                UpgradeKind::AutoScale {
                    target_system_services_size: ReliabilityLevel::Silver.system_service_size()
                }
            );
            let added: Vec<String> = r.added_nodes().into_iter().map(|n| n.node_name).collect();
            assert_eq!(added, vec!["vm3".to_string(), "vm4".to_string()]);
        }

        #[test]
        fn re_adding_a_disabling_node_is_rejected() {
            let mut r = resource(4);
            r.set_target_csm_config(csm("2.0", 3)).unwrap();
            let err = r.set_target_csm_config(csm("3.0", 4)).unwrap_err();
            assert!(matches!(err, Error::Validation { .. }));
        }
    }

    mod completion {
        use super::*;

        #[test]
        fn story_completed_upgrade_becomes_current() {
            let mut r = resource(5);
            r.set_target_wrp_config(wrp("6.0"));
            r.run_state_machine(now()).unwrap();

            r.cluster_upgrade_completed();
            assert!(r.pending.is_none());
            assert_eq!(r.current.wrp_config.code_version.to_string(), "6.0");
            assert_eq!(r.current.external_state.code_version.to_string(), "6.0");

            r.reset();
            assert!(!r.run_state_machine(now()).unwrap());
        }

        #[test]
        fn story_autoscale_is_followed_by_service_resize() {
            let mut r = resource(3);
            r.set_target_csm_config(csm("2.0", 5)).unwrap();
            r.run_state_machine(now()).unwrap();

            r.cluster_upgrade_completed();
            let follow_up = r.pending.clone().unwrap();
            assert!(matches!(follow_up.kind, UpgradeKind::ServiceResize { .. }));
            assert_eq!(r.current.node_config.member_count(), 5);

            r.cluster_upgrade_completed();
            assert!(r.pending.is_none());
        }

        #[test]
        fn story_failure_records_reason_and_clears_pending() {
            let mut r = resource(5);
            r.set_target_wrp_config(wrp("6.0"));
            r.run_state_machine(now()).unwrap();

            r.cluster_upgrade_rolled_back_or_failed(now(), FailureReason::HealthCheck);
            r.reset();

            assert!(r.pending.is_none());
            assert!(r.target_wrp_config.is_none());
            assert_eq!(r.last_failure.as_ref().unwrap().reason, FailureReason::HealthCheck);
            assert_eq!(r.current.wrp_config.code_version.to_string(), "5.0");
        }
    }

    mod removal {
        use super::*;

        #[test]
        fn story_node_removal_moves_enabled_disabling_removed() {
            let mut r = resource(5);
            r.set_target_csm_config(csm("2.0", 4)).unwrap();
            let disabling = r.disabling_nodes();
            assert_eq!(disabling[0].node_state, NodeState::Disabling);

            let version = r.target_node_config.as_ref().unwrap().version;
            assert!(r.set_target_node_config_for_removed_nodes(&disabling, version));
            assert!(r.disabling_nodes().is_empty());
            assert!(r.topology.contains_key("vm4"));

            assert!(r.run_state_machine(now()).unwrap());
            let pending = r.pending.clone().unwrap();
            assert_eq!(pending.flow, UpgradeFlow::ScaleIn);
            assert_eq!(pending.target.node_config.version, 2);
            assert!(pending.target.external_state.manifest.nodes.iter().all(|n| n.node_name != "vm4"));

            r.cluster_upgrade_completed();
            assert!(!r.topology.contains_key("vm4"));
            let removed = r.removed_nodes();
            assert_eq!(removed.len(), 1);
            assert_eq!(removed[0].node_state, NodeState::Removed);
            assert_eq!(removed[0].instance_id, 0);
        }

        #[test]
        fn story_rolled_back_removal_keeps_the_node() {
            let mut r = resource(5);
            r.set_target_csm_config(csm("2.0", 4)).unwrap();
            let disabling = r.disabling_nodes();
            let version = r.target_node_config.as_ref().unwrap().version;
            r.set_target_node_config_for_removed_nodes(&disabling, version);
            assert!(r.run_state_machine(now()).unwrap());

            r.cluster_upgrade_rolled_back_or_failed(now(), FailureReason::HealthCheck);
            r.reset();

            assert!(r.topology.contains_key("vm4"));
            assert_eq!(r.current.node_config.node("vm4").unwrap().node_state, NodeState::Enabled);
            assert!(!r.run_state_machine(now()).unwrap());
            assert!(r.pending.is_none());
        }

        #[test]
        fn removal_derives_health_thresholds() {
            let mut r = resource(5);
            r.set_target_csm_config(csm("2.0", 4)).unwrap();
            let disabling = r.disabling_nodes();
            r.set_target_node_config_for_removed_nodes(&disabling, 1);

            let policy = r.target_policy.clone().unwrap();
            assert_eq!(policy.max_percent_unhealthy_nodes, 20);
            assert_eq!(policy.max_percent_delta_unhealthy_nodes, 20);
            // each node sits in its own upgrade domain
            assert_eq!(policy.max_percent_upgrade_domain_delta_unhealthy_nodes, 100);
        }

        #[test]
        fn configured_thresholds_are_kept() {
            let mut r = resource(5);
            let mut next = csm("2.0", 4);
            next.upgrade_policy.max_percent_unhealthy_nodes = 40;
            r.set_target_csm_config(next).unwrap();
            let disabling = r.disabling_nodes();
            r.set_target_node_config_for_removed_nodes(&disabling, 1);
            assert_eq!(r.target_policy.as_ref().unwrap().max_percent_unhealthy_nodes, 40);
        }

        #[test]
        fn nothing_to_remove_returns_false() {
            let mut r = resource(3);
            let bystander = NodeStatus::enabled("vm0", "primary");
            assert!(!r.set_target_node_config_for_removed_nodes(&[bystander], 1));
            assert!(r.target_node_config.is_none());
        }
    }

    #[test]
    fn persisted_form_carries_type_tags() {
        let mut r = resource(3);
        r.set_target_csm_config(csm("2.0", 5)).unwrap();
        r.run_state_machine(now()).unwrap();

        let json = serde_json::to_string(&r).unwrap();
        let tag = format!("AutoScale@{}", stride_store::RECORD_TYPE_VERSION);
        assert!(json.contains(&tag));
        let back: ClusterResource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
