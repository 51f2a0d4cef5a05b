//! Auxiliary records persisted next to the cluster resource

use serde::{Deserialize, Serialize};
use stride_common::{CodeVersion, Error};
use stride_store::Record;

/// The code version an upgrade was requested for
///
/// Written by the goal-state poller and by user code-upgrade requests;
/// cleared once the package for it has been cleaned up.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CodeUpgradeDetail {
    /// Requested code version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_version: Option<CodeVersion>,
    /// Whether a user requested it
    #[serde(default)]
    pub is_user_initiated: bool,
}

impl Record for CodeUpgradeDetail {
    const KEY: &'static str = "code-upgrade-detail";
    const KIND: &'static str = "CodeUpgradeDetail";
}

/// The last fatal failure of an upgrade attempt
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpgradeErrorDetail {
    /// Stable error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ConfigUpgradeErrorDetail {
    /// Detail describing `err`
    pub fn from_error(err: &Error) -> Self {
        Self {
            error_code: Some(err.error_code().to_string()),
            error_message: Some(err.to_string()),
        }
    }

    /// True if no failure is recorded
    pub fn is_empty(&self) -> bool {
        self.error_code.is_none() && self.error_message.is_none()
    }
}

impl Record for ConfigUpgradeErrorDetail {
    const KEY: &'static str = "config-upgrade-error-detail";
    const KIND: &'static str = "ConfigUpgradeErrorDetail";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_detail_captures_code_and_message() {
        let detail = ConfigUpgradeErrorDetail::from_error(&Error::package("6.0", "download failed"));
        assert_eq!(detail.error_code.as_deref(), Some("PackageFailure"));
        assert!(detail.error_message.unwrap().contains("download failed"));
        assert!(ConfigUpgradeErrorDetail::default().is_empty());
    }

    #[test]
    fn empty_code_detail_serializes_compactly() {
        let json = serde_json::to_string(&CodeUpgradeDetail::default()).unwrap();
        assert_eq!(json, r#"{"isUserInitiated":false}"#);
    }
}
