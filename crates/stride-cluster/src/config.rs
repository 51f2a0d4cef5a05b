//! User (CSM) and admin (WRP) configuration

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use stride_common::{CodeVersion, Error, Result};

/// A named group of settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSection {
    /// Section name (e.g., "FaultInjection")
    pub name: String,
    /// Parameter name to value
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Look up a parameter in a list of sections
pub fn find_setting<'a>(sections: &'a [SettingsSection], section: &str, name: &str) -> Option<&'a str> {
    sections
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(section))
        .and_then(|s| {
            s.parameters
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
}

/// One machine in the desired topology
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescription {
    /// Node name, unique within the cluster
    pub node_name: String,
    /// Machine address
    pub ip_address: String,
    /// Name of the node type
    pub node_type_ref: String,
    /// Fault domain path (e.g., "fd:/dc1/r0")
    pub fault_domain: String,
    /// Upgrade domain
    pub upgrade_domain: String,
}

/// An inclusive port range
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
    /// First port
    pub start_port: u16,
    /// Last port
    pub end_port: u16,
}

/// Node type: endpoints and placement shared by a class of nodes
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTypeDescription {
    /// Node type name
    pub name: String,
    /// Client connection endpoint
    pub client_connection_endpoint_port: u16,
    /// Cluster connection endpoint
    pub cluster_connection_endpoint_port: u16,
    /// Lease driver endpoint
    pub lease_driver_endpoint_port: u16,
    /// Service connection endpoint
    pub service_connection_endpoint_port: u16,
    /// HTTP gateway endpoint, if exposed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_gateway_endpoint_port: Option<u16>,
    /// Application port range
    pub application_ports: PortRange,
    /// Ephemeral port range
    pub ephemeral_ports: PortRange,
    /// System services run on primary node types
    #[serde(default)]
    pub is_primary: bool,
    /// Extra placement properties
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub placement_properties: BTreeMap<String, String>,
}

/// Health thresholds passed to the execution service with each upgrade
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct UpgradeHealthPolicy {
    /// Restart processes even when only configuration changed
    pub force_restart: bool,
    /// Tolerated percentage of unhealthy nodes
    pub max_percent_unhealthy_nodes: u8,
    /// Tolerated increase in unhealthy nodes across the cluster
    pub max_percent_delta_unhealthy_nodes: u8,
    /// Tolerated increase in unhealthy nodes within one upgrade domain
    pub max_percent_upgrade_domain_delta_unhealthy_nodes: u8,
}

/// The user-facing cluster configuration after parsing
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CsmConfig {
    /// User-assigned configuration version
    pub version: String,
    /// Desired machines
    pub nodes: Vec<NodeDescription>,
    /// Node types referenced by `nodes`
    pub node_types: Vec<NodeTypeDescription>,
    /// Cluster settings
    #[serde(default)]
    pub settings: Vec<SettingsSection>,
    /// Upgrade health policy
    #[serde(default)]
    pub upgrade_policy: UpgradeHealthPolicy,
}

impl CsmConfig {
    /// Look up a setting
    pub fn setting(&self, section: &str, name: &str) -> Option<&str> {
        find_setting(&self.settings, section, name)
    }

    /// Node type by name
    pub fn node_type(&self, name: &str) -> Option<&NodeTypeDescription> {
        self.node_types.iter().find(|t| t.name == name)
    }

    /// Node description by name
    pub fn node(&self, name: &str) -> Option<&NodeDescription> {
        self.nodes.iter().find(|n| n.node_name == name)
    }

    /// Structural validation of a user-supplied configuration
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(Error::validation_for_field("version", "must not be empty"));
        }
        if self.nodes.is_empty() {
            return Err(Error::validation_for_field("nodes", "at least one node is required"));
        }

        let mut types = BTreeSet::new();
        for node_type in &self.node_types {
            if !types.insert(node_type.name.as_str()) {
                return Err(Error::validation_for_field(
                    "nodeTypes",
                    format!("duplicate node type '{}'", node_type.name),
                ));
            }
            for range in [node_type.application_ports, node_type.ephemeral_ports] {
                if range.start_port > range.end_port {
                    return Err(Error::validation_for_field(
                        format!("nodeTypes[{}]", node_type.name),
                        "port range start is after its end",
                    ));
                }
            }
        }
        if !self.node_types.iter().any(|t| t.is_primary) {
            return Err(Error::validation_for_field(
                "nodeTypes",
                "one node type must be primary",
            ));
        }

        let mut names = BTreeSet::new();
        let mut addresses = BTreeSet::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if !names.insert(node.node_name.as_str()) {
                return Err(Error::validation_for_field(
                    format!("nodes[{}]", i),
                    format!("duplicate node name '{}'", node.node_name),
                ));
            }
            if !addresses.insert(node.ip_address.as_str()) {
                return Err(Error::validation_for_field(
                    format!("nodes[{}]", i),
                    format!("duplicate address '{}'", node.ip_address),
                ));
            }
            if !types.contains(node.node_type_ref.as_str()) {
                return Err(Error::validation_for_field(
                    format!("nodes[{}].nodeTypeRef", i),
                    format!("node type '{}' is not declared", node.node_type_ref),
                ));
            }
        }
        Ok(())
    }
}

/// Admin configuration: the code version plus settings embedded in its package
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WrpConfig {
    /// Admin configuration version
    pub version: String,
    /// Code version the cluster should run
    pub code_version: CodeVersion,
    /// Whether the code version was requested by a user rather than goal state
    #[serde(default)]
    pub is_user_initiated: bool,
    /// Settings shipped with the package
    #[serde(default)]
    pub settings: Vec<SettingsSection>,
}

impl WrpConfig {
    /// Look up a setting
    pub fn setting(&self, section: &str, name: &str) -> Option<&str> {
        find_setting(&self.settings, section, name)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn valid_configuration_passes() {
        assert!(csm("1.0", 5).validate().is_ok());
    }

    #[test]
    fn undeclared_node_type_is_rejected() {
        let mut config = csm("1.0", 3);
        config.nodes[1].node_type_ref = "db".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Validation { field: Some(ref f), .. } if f == "nodes[1].nodeTypeRef"));
    }

    #[test]
    fn duplicate_names_and_addresses_are_rejected() {
        let mut config = csm("1.0", 3);
        config.nodes[2].node_name = "vm0".to_string();
        assert!(config.validate().is_err());

        let mut config = csm("1.0", 3);
        config.nodes[2].ip_address = config.nodes[0].ip_address.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn requires_a_primary_node_type() {
        let mut config = csm("1.0", 3);
        config.node_types[0].is_primary = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn settings_lookup_is_case_insensitive() {
        let mut config = csm("1.0", 1);
        config.settings.push(SettingsSection {
            name: "FaultInjection".into(),
            parameters: [("FaultFlow".to_string(), "ConfigUpgrade".to_string())].into(),
        });
        assert_eq!(config.setting("faultinjection", "faultflow"), Some("ConfigUpgrade"));
        assert_eq!(config.setting("FaultInjection", "Missing"), None);
    }
}
