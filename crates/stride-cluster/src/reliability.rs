//! Reliability tiers derived from cluster size

use serde::{Deserialize, Serialize};

/// Replica tier for system services, chosen from the number of primary nodes
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReliabilityLevel {
    /// Single replica (fewer than three nodes)
    None,
    /// Three replicas
    Bronze,
    /// Five replicas
    Silver,
    /// Seven replicas
    Gold,
    /// Nine replicas
    Platinum,
}

impl ReliabilityLevel {
    /// Tier for a cluster with `node_count` primary members
    pub fn for_node_count(node_count: usize) -> Self {
        match node_count {
            0..=2 => Self::None,
            3..=4 => Self::Bronze,
            5..=6 => Self::Silver,
            7..=8 => Self::Gold,
            _ => Self::Platinum,
        }
    }

    /// Target replica count
    pub fn replica_count(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Bronze => 3,
            Self::Silver => 5,
            Self::Gold => 7,
            Self::Platinum => 9,
        }
    }

    /// System service size for this tier
    pub fn system_service_size(&self) -> SystemServiceSize {
        let target = self.replica_count();
        SystemServiceSize {
            target_replica_set_size: target,
            min_replica_set_size: target / 2 + 1,
        }
    }
}

impl std::fmt::Display for ReliabilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bronze => write!(f, "Bronze"),
            Self::Silver => write!(f, "Silver"),
            Self::Gold => write!(f, "Gold"),
            Self::Platinum => write!(f, "Platinum"),
        }
    }
}

/// Replica set size applied to stateful system services
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemServiceSize {
    /// Desired replicas
    pub target_replica_set_size: u32,
    /// Quorum floor
    pub min_replica_set_size: u32,
}
