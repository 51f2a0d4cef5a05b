//! Node removal and addition side effects
//!
//! Nodes in one batch are handled concurrently; partial failures are
//! aggregated into a single error so the control loop can decide whether to
//! abandon the attempt.

use std::collections::BTreeSet;

use futures::future::join_all;
use stride_cluster::{ClusterManifest, DeactivationIntent, NodeDescription, NodeState, NodeStatus};
use stride_common::config::OrchestratorConfig;
use stride_common::error::ExecutionErrorCode;
use stride_common::poll::poll_until;
use stride_common::retry::retry_if_retryable;
use stride_common::{CodeVersion, Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::driver::write_manifest;
use crate::execution::{NodeInfo, NodeRuntimeStatus};

/// Applies node membership changes through the execution service
pub struct NodeLifecycleManager<'a> {
    ctx: &'a Context,
    config: &'a OrchestratorConfig,
}

impl<'a> NodeLifecycleManager<'a> {
    /// Create a manager for one orchestration cycle
    pub fn new(ctx: &'a Context, config: &'a OrchestratorConfig) -> Self {
        Self { ctx, config }
    }

    async fn node_list(&self) -> Result<Vec<NodeInfo>> {
        let execution = self.ctx.execution.clone();
        retry_if_retryable(&self.config.retry, "get_node_list", || {
            let execution = execution.clone();
            async move { execution.get_node_list().await }
        })
        .await
    }

    /// Ask every disabling node to deactivate
    ///
    /// Nodes already `Disabled`, `Disabling` or unknown to the execution
    /// service are skipped.
    pub async fn deactivate_nodes(&self, disabling: &[NodeStatus]) -> Result<()> {
        if disabling.is_empty() {
            return Ok(());
        }
        let nodes = self.node_list().await?;

        let pending: Vec<&NodeStatus> = disabling
            .iter()
            .filter(|n| {
                let status = runtime_status(&nodes, &n.node_name);
                if status.is_deactivating_or_gone() {
                    debug!(node = %n.node_name, status = ?status, "node already deactivating");
                    false
                } else {
                    true
                }
            })
            .collect();

        let results = join_all(pending.iter().map(|node| async move {
            let execution = self.ctx.execution.clone();
            let name = node.node_name.clone();
            info!(node = %name, "deactivating node");
            retry_if_retryable(&self.config.retry, "deactivate_node", || {
                let execution = execution.clone();
                let name = name.clone();
                async move {
                    execution
                        .deactivate_node(&name, DeactivationIntent::RemoveNode)
                        .await
                }
            })
            .await
            .map_err(|e| (node.node_name.clone(), e))
        }))
        .await;

        aggregate("deactivate_nodes", results)
    }

    /// Wait until every disabling node reports `Disabled` (or is gone)
    pub async fn poll_deactivated_nodes(
        &self,
        disabling: &[NodeStatus],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let names: BTreeSet<String> = disabling.iter().map(|n| n.node_name.clone()).collect();
        if names.is_empty() {
            return Ok(());
        }
        let execution = self.ctx.execution.clone();

        poll_until(
            cancel,
            self.config.deactivation_timeout(),
            self.config.node_poll_interval(),
            "poll_deactivated_nodes",
            format!("nodes {:?} did not deactivate", names),
            || {
                let execution = execution.clone();
                let names = names.clone();
                async move {
                    let nodes = execution.get_node_list().await?;
                    Ok(names
                        .iter()
                        .all(|name| runtime_status(&nodes, name).is_deactivated()))
                }
            },
        )
        .await?;

        info!(count = disabling.len(), "nodes deactivated");
        Ok(())
    }

    /// Forget the state of removed nodes, best-effort
    ///
    /// Only nodes marked `Removed` are touched.
    pub async fn remove_node_states(&self, removed: &[NodeStatus]) {
        let targets: Vec<&NodeStatus> = removed
            .iter()
            .filter(|n| {
                if n.node_state != NodeState::Removed {
                    warn!(node = %n.node_name, state = %n.node_state, "refusing to remove state of a member node");
                    return false;
                }
                true
            })
            .collect();

        join_all(targets.iter().map(|node| async move {
            let execution = self.ctx.execution.clone();
            let name = node.node_name.clone();
            let result = retry_if_retryable(&self.config.retry, "remove_node_state", || {
                let execution = execution.clone();
                let name = name.clone();
                async move { execution.remove_node_state(&name).await }
            })
            .await;
            match result {
                Ok(()) => info!(node = %name, "node state removed"),
                Err(e) => warn!(node = %name, error = %e, "failed to remove node state"),
            }
        }))
        .await;
    }

    /// Configure, start and activate machines joining the cluster
    ///
    /// Machines whose setup fails part way have their configuration removed
    /// again, best-effort, before the aggregate error is returned.
    pub async fn add_nodes(
        &self,
        added: &[NodeDescription],
        manifest: &ClusterManifest,
        code_version: &CodeVersion,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if added.is_empty() {
            return Ok(());
        }
        let configurator = self.ctx.configurator.clone().ok_or_else(|| {
            Error::validation("node addition requires a node configurator")
        })?;
        if code_version.is_initialization() {
            return Err(Error::internal_with_context(
                "nodes",
                "cannot add nodes before the cluster runs a code version",
            ));
        }

        let nodes = self.node_list().await?;
        let joining: Vec<&NodeDescription> = added
            .iter()
            .filter(|n| runtime_status(&nodes, &n.node_name) != NodeRuntimeStatus::Up)
            .collect();
        if joining.is_empty() {
            debug!("added nodes already up");
            return Ok(());
        }

        let package_path = self.ctx.packages.download(code_version, None).await?;

        let mut manifest = manifest.clone();
        for node in &joining {
            manifest.upsert_node(node);
        }
        let manifest_file = write_manifest(&manifest, &self.config.temp_dir()).await?;
        let manifest_path = manifest_file.path().to_path_buf();

        let results = join_all(joining.iter().map(|node| {
            let configurator = configurator.clone();
            let execution = self.ctx.execution.clone();
            let manifest_path = manifest_path.clone();
            let package_path = package_path.clone();
            async move {
                info!(node = %node.node_name, address = %node.ip_address, "adding node");
                configurator
                    .configure_node(node, &manifest_path, &package_path)
                    .await
                    .map_err(|e| (node.node_name.clone(), e, false))?;
                configurator
                    .start_host_service(node)
                    .await
                    .map_err(|e| (node.node_name.clone(), e, true))?;
                retry_if_retryable(&self.config.retry, "activate_node", || {
                    let execution = execution.clone();
                    let name = node.node_name.clone();
                    async move { execution.activate_node(&name).await }
                })
                .await
                .map_err(|e| (node.node_name.clone(), e, true))
            }
        }))
        .await;

        let mut configured: Vec<&NodeDescription> = Vec::new();
        let mut failures = Vec::new();
        for (node, result) in joining.iter().zip(results) {
            match result {
                Ok(()) => configured.push(node),
                Err((name, e, was_configured)) => {
                    if was_configured {
                        configured.push(node);
                    }
                    failures.push(Err((name, e)));
                }
            }
        }

        let outcome = if failures.is_empty() {
            self.poll_activated_nodes(&joining, cancel).await
        } else {
            aggregate("add_nodes", failures)
        };

        if let Err(e) = &outcome {
            warn!(error = %e, "node addition failed, removing configuration");
            for node in &configured {
                if let Err(rollback) = configurator.remove_node_configuration(node).await {
                    warn!(node = %node.node_name, error = %rollback, "failed to remove node configuration");
                }
            }
        }

        if let Err(e) = self.ctx.packages.remove_local(&package_path).await {
            debug!(path = %package_path.display(), error = %e, "failed to remove local package");
        }
        outcome
    }

    async fn poll_activated_nodes(
        &self,
        joining: &[&NodeDescription],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let names: BTreeSet<String> = joining.iter().map(|n| n.node_name.clone()).collect();
        let execution = self.ctx.execution.clone();

        poll_until(
            cancel,
            self.config.activation_timeout(),
            self.config.node_poll_interval(),
            "poll_activated_nodes",
            format!("nodes {:?} did not come up", names),
            || {
                let execution = execution.clone();
                let names = names.clone();
                async move {
                    let nodes = execution.get_node_list().await?;
                    Ok(names
                        .iter()
                        .all(|name| runtime_status(&nodes, name) == NodeRuntimeStatus::Up))
                }
            },
        )
        .await?;

        info!(count = names.len(), "added nodes are up");
        Ok(())
    }
}

fn runtime_status(nodes: &[NodeInfo], name: &str) -> NodeRuntimeStatus {
    nodes
        .iter()
        .find(|n| n.name == name)
        .map(|n| n.status)
        .unwrap_or(NodeRuntimeStatus::Invalid)
}

/// Collapse per-node results into one error naming every failed node
fn aggregate(operation: &str, results: Vec<std::result::Result<(), (String, Error)>>) -> Result<()> {
    let mut failures: Vec<(String, Error)> = results.into_iter().filter_map(|r| r.err()).collect();
    match failures.len() {
        0 => Ok(()),
        1 => {
            let (node, e) = failures.remove(0);
            warn!(operation, node = %node, error = %e, "node operation failed");
            Err(e)
        }
        n => {
            let detail = failures
                .iter()
                .map(|(node, e)| format!("{}: {}", node, e))
                .collect::<Vec<_>>()
                .join("; ");
            warn!(operation, failed = n, "node operations failed");
            Err(Error::execution(
                operation,
                ExecutionErrorCode::Other,
                format!("{} nodes failed: {}", n, detail),
            ))
        }
    }
}
