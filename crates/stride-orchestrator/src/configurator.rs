//! Pushing configuration to machines joining the cluster

use std::path::Path;

use async_trait::async_trait;
use stride_cluster::NodeDescription;
use stride_common::Result;

#[cfg(test)]
use mockall::automock;

/// Trait abstracting remote machine setup for node addition
///
/// Only used on secure clusters. Implementations own transport and
/// credentials for reaching the new machines.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeConfigurator: Send + Sync {
    /// Install the manifest and code package on a machine
    ///
    /// # Arguments
    ///
    /// * `node` - The machine being added
    /// * `manifest_path` - Manifest including the new machine
    /// * `package_path` - Code package matching the running code version
    async fn configure_node(
        &self,
        node: &NodeDescription,
        manifest_path: &Path,
        package_path: &Path,
    ) -> Result<()>;

    /// Start the host service on a configured machine
    async fn start_host_service(&self, node: &NodeDescription) -> Result<()>;

    /// Undo [`configure_node`](Self::configure_node)
    async fn remove_node_configuration(&self, node: &NodeDescription) -> Result<()>;
}
