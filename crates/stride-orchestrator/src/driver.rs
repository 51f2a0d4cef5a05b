//! Driving the execution service through one upgrade attempt
//!
//! The driver never assumes it is the first to act: every decision is made
//! from the progress the execution service reports, so a restarted
//! orchestrator resumes an attempt without re-issuing commands.

use std::path::Path;

use chrono::{DateTime, Utc};
use stride_cluster::{ClusterManifest, ClusterResource, PendingUpgrade};
use stride_common::config::OrchestratorConfig;
use stride_common::error::ExecutionErrorCode;
use stride_common::poll::sleep_or_cancel;
use stride_common::retry::retry_if_retryable;
use stride_common::{CodeVersion, Error, Result};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::execution::{StartUpgradeRequest, UpgradeProgress, UpgradeState};

/// Serialize a manifest to a temporary file in `dir`
///
/// The file is deleted when the returned handle is dropped.
pub(crate) async fn write_manifest(manifest: &ClusterManifest, dir: &Path) -> Result<NamedTempFile> {
    let body = serde_json::to_vec_pretty(manifest)?;
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<NamedTempFile> {
        std::fs::create_dir_all(&dir)?;
        let mut file = tempfile::Builder::new()
            .prefix("stride-manifest-")
            .suffix(".json")
            .tempfile_in(&dir)?;
        std::io::Write::write_all(&mut file, &body)?;
        Ok(file)
    })
    .await
    .map_err(|e| Error::internal_with_context("driver", format!("manifest writer panicked: {}", e)))?
}

/// Whether a rolled back or failed progress ended after `since`
///
/// Without a failure timestamp the outcome counts as ours only once this
/// driver has issued its own start.
fn ended_since(progress: &UpgradeProgress, since: DateTime<Utc>, started: bool) -> bool {
    match progress.failure_timestamp {
        Some(at) => at >= since,
        None => started,
    }
}

/// Runs the start/poll loop for a pending upgrade
pub struct UpgradeDriver<'a> {
    ctx: &'a Context,
    config: &'a OrchestratorConfig,
}

impl<'a> UpgradeDriver<'a> {
    /// Create a driver for one orchestration cycle
    pub fn new(ctx: &'a Context, config: &'a OrchestratorConfig) -> Self {
        Self { ctx, config }
    }

    async fn progress(&self) -> Result<UpgradeProgress> {
        let execution = self.ctx.execution.clone();
        retry_if_retryable(&self.config.retry, "get_upgrade_progress", || {
            let execution = execution.clone();
            async move { execution.get_upgrade_progress().await }
        })
        .await
    }

    /// Code version the execution service is asked for
    ///
    /// A cluster that has never been upgraded reports the initialization
    /// version; a pending upgrade still carrying it targets the baseline
    /// package the cluster was deployed from.
    async fn resolve_code_version(
        &self,
        reported: &UpgradeProgress,
        pending_code_version: &CodeVersion,
    ) -> Result<CodeVersion> {
        if reported.target_code_version.is_initialization()
            && pending_code_version.is_initialization()
        {
            let baseline = self.ctx.packages.baseline_version().await?;
            debug!(baseline = %baseline, "using baseline package version");
            return Ok(baseline);
        }
        Ok(pending_code_version.clone())
    }

    /// Target the store currently expects, falling back to `ours`
    async fn expected_target(
        &self,
        reported: &UpgradeProgress,
        ours: &(CodeVersion, String),
    ) -> (CodeVersion, String) {
        match self.ctx.store.load::<ClusterResource>().await {
            Ok(Some(stored)) => match stored.value.pending {
                Some(pending) => {
                    let code_version = match self
                        .resolve_code_version(reported, pending.code_version())
                        .await
                    {
                        Ok(v) => v,
                        Err(_) => ours.0.clone(),
                    };
                    (code_version, pending.config_version().to_string())
                }
                None => ours.clone(),
            },
            Ok(None) => ours.clone(),
            Err(e) => {
                debug!(error = %e, "failed to re-read expected target");
                ours.clone()
            }
        }
    }

    async fn start(&self, request: &StartUpgradeRequest, attempt: &Uuid) -> Result<()> {
        let execution = self.ctx.execution.clone();
        let result = retry_if_retryable(&self.config.retry, "start_upgrade", || {
            let execution = execution.clone();
            let request = request.clone();
            async move { execution.start_upgrade(&request).await }
        })
        .await;

        match result {
            Ok(()) => {
                info!(
                    attempt = %attempt,
                    code_version = %request.code_version,
                    config_version = %request.config_version,
                    "upgrade started"
                );
                Ok(())
            }
            Err(e)
                if matches!(
                    e.execution_code(),
                    Some(ExecutionErrorCode::UpgradeInProgress)
                        | Some(ExecutionErrorCode::AlreadyInTargetVersion)
                ) =>
            {
                info!(attempt = %attempt, reason = %e, "start not needed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drive `pending` until the execution service reports a terminal state
    /// for it
    ///
    /// Returns the final progress; rolled back and failed attempts are not
    /// errors. Errors are reserved for failed calls and cancellation.
    pub async fn drive(
        &self,
        pending: &PendingUpgrade,
        cancel: &CancellationToken,
    ) -> Result<UpgradeProgress> {
        let attempt = Uuid::new_v4();
        let mut progress = self.progress().await?;

        let code_version = self
            .resolve_code_version(&progress, pending.code_version())
            .await?;
        let config_version = pending.config_version().to_string();
        let ours = (code_version.clone(), config_version.clone());

        let manifest_file =
            write_manifest(&pending.target.external_state.manifest, &self.config.temp_dir()).await?;
        let request = StartUpgradeRequest {
            manifest_path: manifest_file.path().to_path_buf(),
            code_version,
            config_version,
            policy: pending.policy.clone(),
        };

        info!(
            attempt = %attempt,
            flow = %pending.flow,
            code_version = %request.code_version,
            config_version = %request.config_version,
            state = %progress.upgrade_state,
            "driving upgrade"
        );

        let mut started = false;
        let mut since = pending.started_at;
        loop {
            let state = progress.upgrade_state;
            let ours_reported = progress.targets(&request.code_version, &request.config_version);

            if !state.is_terminal() {
                if ours_reported {
                    debug!(attempt = %attempt, state = %state, "upgrade in progress");
                } else if state == UpgradeState::RollingBackInProgress {
                    debug!(attempt = %attempt, "waiting for another upgrade to roll back");
                } else if !started {
                    info!(
                        attempt = %attempt,
                        running = %progress.target_code_version,
                        "interrupting upgrade toward another target"
                    );
                    self.start(&request, &attempt).await?;
                    started = true;
                    since = Utc::now();
                }
            } else {
                let expected = self.expected_target(&progress, &ours).await;
                let reports_expected = progress.targets(&expected.0, &expected.1);

                if state == UpgradeState::RollingForwardCompleted {
                    if reports_expected {
                        info!(attempt = %attempt, state = %state, "upgrade reached a terminal state");
                        return Ok(progress);
                    }
                    if !started {
                        self.start(&request, &attempt).await?;
                        started = true;
                        since = Utc::now();
                    } else {
                        debug!(
                            attempt = %attempt,
                            reported = %progress.target_code_version,
                            "stale terminal progress, polling again"
                        );
                    }
                } else {
                    let fresh = ended_since(&progress, since, started);
                    if fresh && (reports_expected || started) {
                        warn!(
                            attempt = %attempt,
                            state = %state,
                            reported = %progress.target_code_version,
                            "upgrade ended without completing"
                        );
                        return Ok(progress);
                    }
                    if !started {
                        if reports_expected {
                            info!(attempt = %attempt, state = %state, "earlier attempt toward this target ended, starting again");
                        }
                        self.start(&request, &attempt).await?;
                        started = true;
                        since = Utc::now();
                    } else if state == UpgradeState::Failed {
                        warn!(attempt = %attempt, "execution service reports failure");
                        return Ok(progress);
                    } else {
                        debug!(
                            attempt = %attempt,
                            state = %state,
                            reported = %progress.target_code_version,
                            "stale terminal progress, polling again"
                        );
                    }
                }
            }

            sleep_or_cancel(cancel, self.config.upgrade_poll_interval())
                .await
                .map_err(|_| Error::cancelled("drive_upgrade"))?;
            progress = self.progress().await?;
        }
    }
}
