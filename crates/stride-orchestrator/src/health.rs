//! Health reporting sink
//!
//! Reports are **fire-and-forget**: [`HealthReporter::report`] never returns
//! an error, and a report that cannot be delivered must never interrupt an
//! upgrade.

use std::time::Duration;

use async_trait::async_trait;
use stride_common::HEALTH_SOURCE_ID;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

/// Health state of a property
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthState {
    /// Healthy
    Ok,
    /// Needs attention
    Warning,
    /// Unhealthy
    Error,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "Ok"),
            Self::Warning => write!(f, "Warning"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Properties the orchestrator reports on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HealthProperty {
    /// Persisted state had to be recovered
    DataLossRecovery,
    /// The goal-state manifest could be fetched
    GoalStateReachability,
    /// The running version is close to end of support
    ClusterVersionSupportExpiry,
    /// Injected fault used by upgrade tests
    TestInjection,
}

impl HealthProperty {
    /// Property name as published
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataLossRecovery => "DataLossRecovery",
            Self::GoalStateReachability => "GoalStateReachability",
            Self::ClusterVersionSupportExpiry => "ClusterVersionSupportExpiry",
            Self::TestInjection => "TestInjection",
        }
    }
}

impl std::fmt::Display for HealthProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One health report
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReport {
    /// Reporting component
    pub source_id: String,
    /// Property
    pub property: HealthProperty,
    /// State
    pub state: HealthState,
    /// Human-readable description
    pub description: String,
    /// How long the report stays valid; forever when unset
    pub time_to_live: Option<Duration>,
}

impl HealthReport {
    /// Report from the orchestrator with no expiry
    pub fn new(property: HealthProperty, state: HealthState, description: impl Into<String>) -> Self {
        Self {
            source_id: HEALTH_SOURCE_ID.to_string(),
            property,
            state,
            description: description.into(),
            time_to_live: None,
        }
    }

    /// Shorthand for an `Ok` report clearing `property`
    pub fn ok(property: HealthProperty) -> Self {
        Self::new(property, HealthState::Ok, "")
    }

    /// Expire the report after `ttl`
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// Trait for publishing health reports
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthReporter: Send + Sync {
    /// Publish a report; failures are logged, never returned
    async fn report(&self, report: HealthReport);
}

/// Writes every report to the log
pub struct TracingHealthReporter;

#[async_trait]
impl HealthReporter for TracingHealthReporter {
    async fn report(&self, report: HealthReport) {
        let ttl_secs = report.time_to_live.map(|t| t.as_secs());
        match report.state {
            HealthState::Ok => info!(
                source = %report.source_id,
                property = %report.property,
                ttl_secs,
                "health ok"
            ),
            HealthState::Warning => warn!(
                source = %report.source_id,
                property = %report.property,
                description = %report.description,
                ttl_secs,
                "health warning"
            ),
            HealthState::Error => error!(
                source = %report.source_id,
                property = %report.property,
                description = %report.description,
                ttl_secs,
                "health error"
            ),
        }
    }
}

/// Forwards reports to a channel consumed by the hosting process
pub struct ChannelHealthReporter {
    tx: mpsc::Sender<HealthReport>,
}

impl ChannelHealthReporter {
    /// Create a reporter and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<HealthReport>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl HealthReporter for ChannelHealthReporter {
    async fn report(&self, report: HealthReport) {
        let property = report.property;
        if let Err(e) = self.tx.try_send(report) {
            debug!(property = %property, error = %e, "health report dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporters_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TracingHealthReporter>();
        assert_send_sync::<ChannelHealthReporter>();
    }

    #[tokio::test]
    async fn channel_reporter_forwards_reports() {
        let (reporter, mut rx) = ChannelHealthReporter::new(4);
        reporter
            .report(HealthReport::new(
                HealthProperty::GoalStateReachability,
                HealthState::Warning,
                "unreachable",
            ))
            .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.property, HealthProperty::GoalStateReachability);
        assert_eq!(received.source_id, HEALTH_SOURCE_ID);
    }

    #[tokio::test]
    async fn full_channel_drops_without_blocking() {
        let (reporter, _rx) = ChannelHealthReporter::new(1);
        reporter.report(HealthReport::ok(HealthProperty::TestInjection)).await;
        reporter.report(HealthReport::ok(HealthProperty::TestInjection)).await;
    }

    #[tokio::test]
    async fn tracing_reporter_accepts_every_state() {
        let reporter = TracingHealthReporter;
        for state in [HealthState::Ok, HealthState::Warning, HealthState::Error] {
            reporter
                .report(
                    HealthReport::new(HealthProperty::DataLossRecovery, state, "x")
                        .with_ttl(Duration::from_secs(60)),
                )
                .await;
        }
    }

    #[test]
    fn property_names() {
        assert_eq!(HealthProperty::TestInjection.as_str(), "TestInjection");
        assert_eq!(
            HealthProperty::ClusterVersionSupportExpiry.to_string(),
            "ClusterVersionSupportExpiry"
        );
    }
}
