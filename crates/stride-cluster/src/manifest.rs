//! Cluster manifest handed to the execution service

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{CsmConfig, NodeDescription, NodeTypeDescription, PortRange, SettingsSection, WrpConfig};
use crate::node::{NodeConfig, NodeState};

/// Placement property every node type carries
pub const NODE_TYPE_NAME_PROPERTY: &str = "NodeTypeName";

/// A node entry in the manifest
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestNode {
    /// Node name
    pub node_name: String,
    /// Machine address
    pub ip_address: String,
    /// Node type name
    pub node_type: String,
    /// Fault domain
    pub fault_domain: String,
    /// Upgrade domain
    pub upgrade_domain: String,
}

/// Endpoints opened on every node of a type
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    /// Client connection endpoint
    pub client_connection: u16,
    /// Cluster connection endpoint
    pub cluster_connection: u16,
    /// Lease driver endpoint
    pub lease_driver: u16,
    /// Service connection endpoint
    pub service_connection: u16,
    /// HTTP gateway endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_gateway: Option<u16>,
    /// Application ports
    pub application_ports: PortRange,
    /// Ephemeral ports
    pub ephemeral_ports: PortRange,
}

/// A node type entry in the manifest
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestNodeType {
    /// Node type name
    pub name: String,
    /// Endpoints
    pub endpoints: Endpoints,
    /// Placement properties, always including `NodeTypeName`
    pub placement_properties: BTreeMap<String, String>,
}

impl From<&NodeTypeDescription> for ManifestNodeType {
    fn from(t: &NodeTypeDescription) -> Self {
        let mut placement_properties = t.placement_properties.clone();
        placement_properties
            .entry(NODE_TYPE_NAME_PROPERTY.to_string())
            .or_insert_with(|| t.name.clone());
        Self {
            name: t.name.clone(),
            endpoints: Endpoints {
                client_connection: t.client_connection_endpoint_port,
                cluster_connection: t.cluster_connection_endpoint_port,
                lease_driver: t.lease_driver_endpoint_port,
                service_connection: t.service_connection_endpoint_port,
                http_gateway: t.http_gateway_endpoint_port,
                application_ports: t.application_ports,
                ephemeral_ports: t.ephemeral_ports,
            },
            placement_properties,
        }
    }
}

/// The full cluster description for one upgrade
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterManifest {
    /// Manifest (config) version, `{csm version}-n{node config version}`
    pub version: String,
    /// Member nodes
    pub nodes: Vec<ManifestNode>,
    /// Node types in use
    pub node_types: Vec<ManifestNodeType>,
    /// Merged cluster and package settings
    pub settings: Vec<SettingsSection>,
}

impl ClusterManifest {
    /// Manifest version for a configuration and node configuration pair
    pub fn version_for(csm: &CsmConfig, node_config: &NodeConfig) -> String {
        format!("{}-n{}", csm.version, node_config.version)
    }

    /// Build the manifest for the given targets
    ///
    /// Nodes come from `topology`; nodes marked `Removed` in `node_config`
    /// are left out. Package settings are overridden by cluster settings of
    /// the same section and name.
    pub fn generate(
        csm: &CsmConfig,
        wrp: &WrpConfig,
        node_config: &NodeConfig,
        topology: &BTreeMap<String, NodeDescription>,
    ) -> Self {
        let nodes: Vec<ManifestNode> = topology
            .values()
            .filter(|n| {
                node_config
                    .node(&n.node_name)
                    .map(|s| s.node_state != NodeState::Removed)
                    .unwrap_or(true)
            })
            .map(|n| ManifestNode {
                node_name: n.node_name.clone(),
                ip_address: n.ip_address.clone(),
                node_type: n.node_type_ref.clone(),
                fault_domain: n.fault_domain.clone(),
                upgrade_domain: n.upgrade_domain.clone(),
            })
            .collect();

        let node_types = csm
            .node_types
            .iter()
            .filter(|t| nodes.iter().any(|n| n.node_type == t.name))
            .map(ManifestNodeType::from)
            .collect();

        Self {
            version: Self::version_for(csm, node_config),
            nodes,
            node_types,
            settings: merge_settings(&wrp.settings, &csm.settings),
        }
    }

    /// Add or update a node entry; used when pushing configuration to new machines
    pub fn upsert_node(&mut self, node: &NodeDescription) {
        let entry = ManifestNode {
            node_name: node.node_name.clone(),
            ip_address: node.ip_address.clone(),
            node_type: node.node_type_ref.clone(),
            fault_domain: node.fault_domain.clone(),
            upgrade_domain: node.upgrade_domain.clone(),
        };
        match self.nodes.iter_mut().find(|n| n.node_name == node.node_name) {
            Some(existing) => *existing = entry,
            None => self.nodes.push(entry),
        }
    }
}

fn merge_settings(base: &[SettingsSection], overrides: &[SettingsSection]) -> Vec<SettingsSection> {
    let mut merged: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for section in base.iter().chain(overrides) {
        merged
            .entry(section.name.clone())
            .or_default()
            .extend(section.parameters.clone());
    }
    merged
        .into_iter()
        .map(|(name, parameters)| SettingsSection { name, parameters })
        .collect()
}
