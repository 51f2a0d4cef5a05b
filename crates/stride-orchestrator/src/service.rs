//! Long-running owner of the control loop

use std::sync::Arc;
use std::time::Duration;

use stride_common::config::OrchestratorConfig;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::Context;
use crate::goal_state::GoalStatePoller;
use crate::orchestrator::{OrchestrationOutcome, UpgradeOrchestrator};

/// Runs [`UpgradeOrchestrator::orchestrate_upgrade`] on a timer or when woken
///
/// Only the current primary of a replicated deployment should run this;
/// each start resumes from the persisted resource.
pub struct OrchestratorService {
    orchestrator: UpgradeOrchestrator,
    wake: Arc<Notify>,
    goal_state: bool,
}

impl OrchestratorService {
    /// Service over `ctx`
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            orchestrator: UpgradeOrchestrator::new(ctx),
            wake: Arc::new(Notify::new()),
            goal_state: false,
        }
    }

    /// Also run the goal-state poller as a sibling task
    pub fn with_goal_state(mut self) -> Self {
        self.goal_state = true;
        self
    }

    /// Handle that triggers an immediate cycle
    pub fn wake(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Run until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!("orchestrator service started");
        let poller = self.goal_state.then(|| {
            let poller = GoalStatePoller::new(self.orchestrator.context().clone(), self.wake.clone());
            tokio::spawn({
                let cancel = cancel.clone();
                async move { poller.run(cancel).await }
            })
        });

        loop {
            let interval = self.run_cycle(&cancel).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if let Some(handle) = poller {
            if let Err(e) = handle.await {
                warn!(error = %e, "goal state poller task failed");
            }
        }
        info!("orchestrator service stopped");
    }

    /// One orchestration call; returns the delay before the next one
    async fn run_cycle(&self, cancel: &CancellationToken) -> Duration {
        let interval = match self.orchestrator.context().load_config() {
            Ok(config) => config.loop_interval(),
            Err(e) => {
                error!(error = %e, "invalid configuration, using defaults for the loop interval");
                OrchestratorConfig::default().loop_interval()
            }
        };
        if cancel.is_cancelled() {
            return interval;
        }

        match self.orchestrator.orchestrate_upgrade(cancel).await {
            Ok(OrchestrationOutcome::Idle) => {}
            Ok(OrchestrationOutcome::Abandoned { error_code }) => {
                warn!(error_code = %error_code, "upgrade attempt abandoned")
            }
            Ok(outcome) => info!(outcome = %outcome, "upgrade attempt finished"),
            Err(e) if e.is_cancelled() => info!("orchestration cancelled"),
            Err(e) => warn!(error = %e, retryable = e.is_retryable(), "orchestration failed, will retry"),
        }
        interval
    }
}
