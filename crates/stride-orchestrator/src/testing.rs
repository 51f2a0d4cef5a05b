//! Fixtures shared by the unit tests of this crate

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stride_cluster::config::PortRange;
use stride_cluster::{CsmConfig, NodeDescription, NodeTypeDescription, UpgradeHealthPolicy, WrpConfig};
use stride_common::retry::RetryConfig;
use stride_common::CodeVersion;
use stride_store::{MemoryStore, StoreManager};

pub fn v(s: &str) -> CodeVersion {
    s.parse().unwrap()
}

pub fn node_type(name: &str) -> NodeTypeDescription {
    NodeTypeDescription {
        name: name.to_string(),
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
        node_types: vec![node_type("primary")],
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

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        backoff_multiplier: 1.0,
    }
}

pub fn memory_store() -> (Arc<MemoryStore>, StoreManager) {
    let raw = Arc::new(MemoryStore::new());
    let manager = StoreManager::new(raw.clone(), fast_retry());
    (raw, manager)
}
