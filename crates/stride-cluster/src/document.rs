//! JSON cluster configuration documents
//!
//! The request-facing shell accepts and returns configuration as a JSON
//! document tagged with an API version. Documents map one-to-one onto
//! [`CsmConfig`]; no cross-version schema mapping is performed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stride_common::{Error, Result};

use crate::config::{CsmConfig, NodeDescription, NodeTypeDescription, SettingsSection, UpgradeHealthPolicy};

/// API versions accepted by [`parse_config_document`]
pub const SUPPORTED_API_VERSIONS: &[&str] = &["04-2017", "10-2017"];

/// API version used when the caller does not ask for one
pub const DEFAULT_API_VERSION: &str = "10-2017";

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigDocument {
    api_version: String,
    #[serde(default)]
    name: String,
    cluster_configuration_version: String,
    nodes: Vec<DocumentNode>,
    properties: DocumentProperties,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentNode {
    node_name: String,
    #[serde(rename = "iPAddress")]
    ip_address: String,
    node_type_ref: String,
    fault_domain: String,
    upgrade_domain: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentProperties {
    node_types: Vec<NodeTypeDescription>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    fabric_settings: Vec<DocumentSection>,
    #[serde(default)]
    upgrade_policy: UpgradeHealthPolicy,
}

#[derive(Debug, Deserialize, Serialize)]
struct DocumentSection {
    name: String,
    #[serde(default)]
    parameters: Vec<DocumentParameter>,
}

#[derive(Debug, Deserialize, Serialize)]
struct DocumentParameter {
    name: String,
    value: String,
}

fn check_api_version(api_version: &str) -> Result<()> {
    if SUPPORTED_API_VERSIONS.contains(&api_version) {
        Ok(())
    } else {
        Err(Error::validation_for_field(
            "apiVersion",
            format!(
                "unsupported api version '{}', expected one of: {}",
                api_version,
                SUPPORTED_API_VERSIONS.join(", ")
            ),
        ))
    }
}

/// Parse and validate a configuration document
pub fn parse_config_document(json: &str) -> Result<CsmConfig> {
    let document: ConfigDocument = serde_json::from_str(json)
        .map_err(|e| Error::validation(format!("malformed configuration document: {}", e)))?;
    check_api_version(&document.api_version)?;

    let csm = CsmConfig {
        version: document.cluster_configuration_version,
        nodes: document
            .nodes
            .into_iter()
            .map(|n| NodeDescription {
                node_name: n.node_name,
                ip_address: n.ip_address,
                node_type_ref: n.node_type_ref,
                fault_domain: n.fault_domain,
                upgrade_domain: n.upgrade_domain,
            })
            .collect(),
        node_types: document.properties.node_types,
        settings: document
            .properties
            .fabric_settings
            .into_iter()
            .map(|s| SettingsSection {
                name: s.name,
                parameters: s
                    .parameters
                    .into_iter()
                    .map(|p| (p.name, p.value))
                    .collect::<BTreeMap<_, _>>(),
            })
            .collect(),
        upgrade_policy: document.properties.upgrade_policy,
    };
    csm.validate()?;
    Ok(csm)
}

/// Render `csm` as a configuration document of `api_version`
pub fn to_config_document(csm: &CsmConfig, cluster_name: &str, api_version: &str) -> Result<String> {
    check_api_version(api_version)?;
    let document = ConfigDocument {
        api_version: api_version.to_string(),
        name: cluster_name.to_string(),
        cluster_configuration_version: csm.version.clone(),
        nodes: csm
            .nodes
            .iter()
            .map(|n| DocumentNode {
                node_name: n.node_name.clone(),
                ip_address: n.ip_address.clone(),
                node_type_ref: n.node_type_ref.clone(),
                fault_domain: n.fault_domain.clone(),
                upgrade_domain: n.upgrade_domain.clone(),
            })
            .collect(),
        properties: DocumentProperties {
            node_types: csm.node_types.clone(),
            fabric_settings: csm
                .settings
                .iter()
                .map(|s| DocumentSection {
                    name: s.name.clone(),
                    parameters: s
                        .parameters
                        .iter()
                        .map(|(name, value)| DocumentParameter {
                            name: name.clone(),
                            value: value.clone(),
                        })
                        .collect(),
                })
                .collect(),
            upgrade_policy: csm.upgrade_policy.clone(),
        },
    };
    serde_json::to_string_pretty(&document).map_err(Error::from)
}
