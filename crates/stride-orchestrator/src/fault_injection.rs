//! Test-only fault injection driven by cluster settings
//!
//! A `FaultInjection` section with a `FaultFlow` parameter naming the flow of
//! the pending upgrade raises an unhealthy `TestInjection` report before the
//! upgrade is started, which makes the execution service's health checks
//! fail and roll the upgrade back.

use stride_cluster::config::find_setting;
use stride_cluster::{ClusterResource, UpgradeFlow};
use tracing::{info, warn};

use crate::health::{HealthProperty, HealthReport, HealthReporter, HealthState};

/// Settings section carrying fault injection parameters
pub const FAULT_INJECTION_SECTION: &str = "FaultInjection";
/// Parameter naming the upgrade flow to fail
pub const FAULT_FLOW_PARAMETER: &str = "FaultFlow";

/// The flow configured for fault injection, if any
///
/// Read from the target configuration when one is recorded, else from the
/// pending upgrade's target.
pub fn configured_fault_flow(resource: &ClusterResource) -> Option<UpgradeFlow> {
    let csm = resource
        .target_csm_config
        .as_ref()
        .or_else(|| resource.pending.as_ref().map(|p| &p.target.csm_config))?;
    let value = find_setting(&csm.settings, FAULT_INJECTION_SECTION, FAULT_FLOW_PARAMETER)?;
    match value.parse() {
        Ok(flow) => Some(flow),
        Err(e) => {
            warn!(value = %value, error = %e, "ignoring fault injection setting");
            None
        }
    }
}

/// Raise the injected fault if it targets the pending upgrade
///
/// Returns true if a fault was raised; the caller clears it with
/// [`clear_fault`] once the drive ends.
pub async fn inject_fault(resource: &ClusterResource, health: &dyn HealthReporter) -> bool {
    let Some(pending) = &resource.pending else {
        return false;
    };
    let Some(flow) = configured_fault_flow(resource) else {
        return false;
    };
    if flow != pending.flow {
        return false;
    }

    info!(flow = %flow, "injecting upgrade fault");
    health
        .report(HealthReport::new(
            HealthProperty::TestInjection,
            HealthState::Error,
            format!("fault injected for {} upgrade", flow),
        ))
        .await;
    true
}

/// Clear a fault raised by [`inject_fault`]
pub async fn clear_fault(health: &dyn HealthReporter) {
    health
        .report(HealthReport::ok(HealthProperty::TestInjection))
        .await;
}
