//! Scheduling automatic code upgrades from the goal-state manifest
//!
//! The poller never starts an upgrade itself. It provisions the packages on
//! the way to the selected target, records a [`CodeUpgradeDetail`] and wakes
//! the control loop, which picks the detail up on its next iteration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use stride_cluster::{ClusterResource, CodeUpgradeDetail};
use stride_common::config::OrchestratorConfig;
use stride_common::poll::sleep_or_cancel;
use stride_common::retry::retry_if_retryable;
use stride_common::{CodeVersion, Error, Result};
use stride_goalstate::{select_target, GoalStateModel, GoalStateSource, HttpGoalStateClient};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::health::{HealthProperty, HealthReport, HealthState};

/// What one poll cycle did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Automatic upgrades are turned off
    Disabled,
    /// Outside the provisioning window
    OutsideWindow,
    /// The manifest could not be fetched
    Unreachable,
    /// An upgrade is already pending
    UpgradeInFlight,
    /// A user-requested code upgrade takes precedence
    UserRequestPending,
    /// The running version is the furthest reachable one
    UpToDate,
    /// The target was already recorded by an earlier cycle
    AlreadyScheduled {
        /// Recorded target
        target: CodeVersion,
    },
    /// A code upgrade to `target` was recorded
    Scheduled {
        /// Selected target
        target: CodeVersion,
    },
}

/// Periodically selects and stages the next code version
pub struct GoalStatePoller {
    ctx: Arc<Context>,
    wake: Arc<Notify>,
    source: Option<Arc<dyn GoalStateSource>>,
}

impl GoalStatePoller {
    /// Poller sharing `wake` with the control loop
    pub fn new(ctx: Arc<Context>, wake: Arc<Notify>) -> Self {
        Self {
            ctx,
            wake,
            source: None,
        }
    }

    /// Fetch the manifest from `source` instead of the configured URI
    pub fn with_source(mut self, source: Arc<dyn GoalStateSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Poll until cancelled, re-reading configuration every cycle
    pub async fn run(&self, cancel: CancellationToken) {
        info!("goal state poller started");
        loop {
            let interval = match self.ctx.load_config() {
                Ok(config) => config.goal_state.poll_interval(),
                Err(e) => {
                    warn!(error = %e, "invalid configuration, goal state poll skipped");
                    stride_common::config::GoalStateConfig::default().poll_interval()
                }
            };

            match self.run_once(Utc::now()).await {
                Ok(outcome) => debug!(outcome = ?outcome, "goal state poll finished"),
                Err(e) if e.is_cancelled() => break,
                Err(e) => warn!(error = %e, "goal state poll failed"),
            }

            if sleep_or_cancel(&cancel, interval).await.is_err() {
                break;
            }
        }
        info!("goal state poller stopped");
    }

    /// Run a single poll cycle at `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<PollOutcome> {
        let config = self.ctx.load_config()?;
        let goal_state = &config.goal_state;
        if !goal_state.enabled {
            return Ok(PollOutcome::Disabled);
        }
        if let Some(window) = &goal_state.provisioning_window {
            if !window.contains(now) {
                debug!(
                    start_hour = window.start_hour,
                    end_hour = window.end_hour,
                    "outside provisioning window"
                );
                return Ok(PollOutcome::OutsideWindow);
            }
        }

        let model = match self.fetch(&config).await {
            Ok(model) => {
                self.ctx
                    .health
                    .report(HealthReport::ok(HealthProperty::GoalStateReachability))
                    .await;
                model
            }
            Err(e) => {
                warn!(error = %e, "goal state manifest unavailable");
                self.ctx
                    .health
                    .report(HealthReport::new(
                        HealthProperty::GoalStateReachability,
                        HealthState::Warning,
                        e.to_string(),
                    ))
                    .await;
                return Ok(PollOutcome::Unreachable);
            }
        };

        let resource = self
            .ctx
            .store
            .load::<ClusterResource>()
            .await?
            .ok_or_else(|| Error::not_found("ClusterResource", "cluster-resource"))?
            .value;
        let running = resource.current.wrp_config.code_version.clone();

        let expiry = match model.check_support_expiry(&running, now, goal_state.expiry_reminder()) {
            Some(warning) => {
                warn!(warning = %warning, "running version is close to end of support");
                HealthReport::new(
                    HealthProperty::ClusterVersionSupportExpiry,
                    HealthState::Warning,
                    warning.to_string(),
                )
            }
            None => HealthReport::ok(HealthProperty::ClusterVersionSupportExpiry),
        };
        self.ctx.health.report(expiry).await;

        if resource.has_pending() {
            return Ok(PollOutcome::UpgradeInFlight);
        }
        let detail = self
            .ctx
            .store
            .load::<CodeUpgradeDetail>()
            .await?
            .map(|s| s.value)
            .unwrap_or_default();
        if detail.is_user_initiated && detail.code_version.is_some() {
            return Ok(PollOutcome::UserRequestPending);
        }

        let selection = select_target(&running, &model);
        if !selection.is_upgrade() {
            return Ok(PollOutcome::UpToDate);
        }
        if detail.code_version.as_ref() == Some(&selection.target) {
            return Ok(PollOutcome::AlreadyScheduled {
                target: selection.target,
            });
        }

        info!(
            running = %running,
            target = %selection.target,
            hops = selection.path.len(),
            "goal state upgrade selected"
        );
        self.provision_path(&selection.path, &selection.target, &config)
            .await?;

        self.ctx
            .store
            .update::<CodeUpgradeDetail, _>(|d| {
                *d = CodeUpgradeDetail {
                    code_version: Some(selection.target.clone()),
                    is_user_initiated: false,
                }
            })
            .await?;
        self.wake.notify_one();
        Ok(PollOutcome::Scheduled {
            target: selection.target,
        })
    }

    async fn fetch(&self, config: &OrchestratorConfig) -> Result<GoalStateModel> {
        if let Some(source) = &self.source {
            return source.fetch().await;
        }
        let uri = config
            .goal_state
            .uri
            .as_deref()
            .ok_or_else(|| Error::goal_state("no goal state uri is configured"))?;
        HttpGoalStateClient::new(uri)?.fetch().await
    }

    /// Download and provision every hop not provisioned yet
    ///
    /// The target's local package is kept so the control loop reuses it.
    async fn provision_path(
        &self,
        path: &[stride_goalstate::PackageDetails],
        target: &CodeVersion,
        config: &OrchestratorConfig,
    ) -> Result<()> {
        let execution = self.ctx.execution.clone();
        let provisioned = retry_if_retryable(&config.retry, "list_provisioned_versions", || {
            let execution = execution.clone();
            async move { execution.list_provisioned_versions(None).await }
        })
        .await?;

        for hop in path {
            if provisioned.contains(&hop.version) {
                debug!(version = %hop.version, "hop already provisioned");
                continue;
            }
            let package_path = self
                .ctx
                .packages
                .download(&hop.version, hop.target_package_location.clone())
                .await?;
            retry_if_retryable(&config.retry, "provision", || {
                let execution = execution.clone();
                let package_path = package_path.clone();
                let version = hop.version.clone();
                async move { execution.provision(&version, &package_path).await }
            })
            .await?;
            info!(version = %hop.version, "hop provisioned");

            if hop.version != *target {
                if let Err(e) = self.ctx.packages.remove_local(&package_path).await {
                    debug!(path = %package_path.display(), error = %e, "failed to remove local package");
                }
            }
        }
        Ok(())
    }
}
