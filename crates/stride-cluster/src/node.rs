//! Node membership state tracked by the orchestrator

use serde::{Deserialize, Serialize};

/// Lifecycle state of a member node
///
/// `Enabled` → `Disabling` (removed from the desired topology, deactivation
/// requested) → `Removed` (deactivation confirmed and folded into an upgrade).
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Member of the cluster
    #[default]
    Enabled,
    /// Being taken out of the cluster
    Disabling,
    /// Taken out of the cluster; node state may still need cleanup
    Removed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enabled => write!(f, "Enabled"),
            Self::Disabling => write!(f, "Disabling"),
            Self::Removed => write!(f, "Removed"),
        }
    }
}

/// Why a node is deactivated
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum DeactivationIntent {
    /// Not deactivated
    #[default]
    None,
    /// Temporarily paused
    Pause,
    /// Restarted in place
    Restart,
    /// Node data will be wiped
    RemoveData,
    /// Node leaves the cluster
    RemoveNode,
}

impl std::fmt::Display for DeactivationIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Pause => write!(f, "Pause"),
            Self::Restart => write!(f, "Restart"),
            Self::RemoveData => write!(f, "RemoveData"),
            Self::RemoveNode => write!(f, "RemoveNode"),
        }
    }
}

/// Status of one node as recorded in a node configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Node name
    pub node_name: String,
    /// Node type the node belongs to
    pub node_type: String,
    /// Lifecycle state
    pub node_state: NodeState,
    /// Deactivation intent recorded for the node
    #[serde(default)]
    pub deactivation_intent: DeactivationIntent,
    /// Instance id; reset to zero once removed
    #[serde(default)]
    pub instance_id: u64,
}

impl NodeStatus {
    /// A newly added, enabled node
    pub fn enabled(node_name: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            node_type: node_type.into(),
            node_state: NodeState::Enabled,
            deactivation_intent: DeactivationIntent::None,
            instance_id: 0,
        }
    }
}

/// Versioned set of node statuses
///
/// The version changes whenever membership materially changes, which is what
/// makes a membership change an upgrade.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Monotonic version
    pub version: u64,
    /// Per-node status
    #[serde(default)]
    pub nodes_status: Vec<NodeStatus>,
}

impl NodeConfig {
    /// Status of a node by name
    pub fn node(&self, name: &str) -> Option<&NodeStatus> {
        self.nodes_status.iter().find(|n| n.node_name == name)
    }

    /// Nodes in the given state
    pub fn in_state(&self, state: NodeState) -> Vec<NodeStatus> {
        self.nodes_status
            .iter()
            .filter(|n| n.node_state == state)
            .cloned()
            .collect()
    }

    /// Nodes being removed
    pub fn disabling(&self) -> Vec<NodeStatus> {
        self.in_state(NodeState::Disabling)
    }

    /// Nodes already removed
    pub fn removed(&self) -> Vec<NodeStatus> {
        self.in_state(NodeState::Removed)
    }

    /// Number of nodes that are still members (enabled or disabling)
    pub fn member_count(&self) -> usize {
        self.nodes_status
            .iter()
            .filter(|n| n.node_state != NodeState::Removed)
            .count()
    }

    /// Copy without `Removed` entries
    pub fn without_removed(&self) -> Self {
        Self {
            version: self.version,
            nodes_status: self
                .nodes_status
                .iter()
                .filter(|n| n.node_state != NodeState::Removed)
                .cloned()
                .collect(),
        }
    }
}
