//! Release manifest entries

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use stride_common::{CodeVersion, Error, Result};

/// One published code version
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PackageDetails {
    /// Code version of the package
    pub version: CodeVersion,
    /// Lowest running version allowed to upgrade directly to this one
    pub min_version: CodeVersion,
    /// The package must not be upgraded to
    #[serde(default)]
    pub is_upgrade_disabled: bool,
    /// Clusters running this package must not be downgraded
    #[serde(default)]
    pub is_downgrade_disabled: bool,
    /// End of support
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_expiry_date: Option<DateTime<Utc>>,
    /// The recommended version
    #[serde(default)]
    pub is_goal_package: bool,
    /// Where the package can be downloaded from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_package_location: Option<String>,
}

impl PackageDetails {
    /// True once support has ended
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.support_expiry_date
            .map(|expiry| expiry < now)
            .unwrap_or(false)
    }

    /// True if a cluster running `running` may upgrade straight to this package
    pub fn accepts_upgrade_from(&self, running: &CodeVersion) -> bool {
        !self.is_upgrade_disabled && self.min_version <= *running && *running < self.version
    }
}

/// Which packages a listing returns
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageSet {
    /// Every package
    All,
    /// Packages whose support has not ended
    Supported,
    /// Only the goal package
    Latest,
}

impl std::str::FromStr for PackageSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "supported" => Ok(Self::Supported),
            "latest" => Ok(Self::Latest),
            _ => Err(Error::validation(format!(
                "invalid package set: {s}, expected one of: all, supported, latest"
            ))),
        }
    }
}

/// Warning that the running version is close to, or past, end of support
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpiryWarning {
    /// Running version
    pub version: CodeVersion,
    /// End of support
    pub expires_at: DateTime<Utc>,
    /// Support already ended
    pub expired: bool,
}

impl std::fmt::Display for ExpiryWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.expired {
            write!(
                f,
                "support for version {} ended on {}; upgrade to a supported version",
                self.version,
                self.expires_at.format("%Y-%m-%d")
            )
        } else {
            write!(
                f,
                "support for version {} ends on {}; upgrade to a supported version",
                self.version,
                self.expires_at.format("%Y-%m-%d")
            )
        }
    }
}

/// The published release manifest
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct GoalStateModel {
    /// Published packages
    #[serde(default)]
    pub packages: Vec<PackageDetails>,
}

impl GoalStateModel {
    /// Parse a manifest document
    pub fn parse(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Err(Error::goal_state("goal state document is empty"));
        }
        serde_json::from_str(json)
            .map_err(|e| Error::goal_state(format!("goal state document is malformed: {}", e)))
    }

    /// Entry for `version`
    pub fn entry(&self, version: &CodeVersion) -> Option<&PackageDetails> {
        self.packages.iter().find(|p| p.version == *version)
    }

    /// The goal package, if one is marked
    pub fn goal_package(&self) -> Option<&PackageDetails> {
        self.packages.iter().find(|p| p.is_goal_package)
    }

    /// List packages
    pub fn packages(&self, set: PackageSet, now: DateTime<Utc>) -> Result<Vec<PackageDetails>> {
        match set {
            PackageSet::All => Ok(self.packages.clone()),
            PackageSet::Supported => Ok(self
                .packages
                .iter()
                .filter(|p| !p.is_expired(now))
                .cloned()
                .collect()),
            PackageSet::Latest => self
                .goal_package()
                .cloned()
                .map(|p| vec![p])
                .ok_or_else(|| Error::goal_state("no goal package is published")),
        }
    }

    /// Warn if the running version's support ends within `reminder`
    ///
    /// The goal package never warns. Versions absent from the manifest or
    /// without an expiry date have nothing to report.
    pub fn check_support_expiry(
        &self,
        current: &CodeVersion,
        now: DateTime<Utc>,
        reminder: Duration,
    ) -> Option<ExpiryWarning> {
        let entry = self.entry(current)?;
        if entry.is_goal_package {
            return None;
        }
        let expires_at = entry.support_expiry_date?;
        if expires_at - now > reminder {
            return None;
        }
        Some(ExpiryWarning {
            version: current.clone(),
            expires_at,
            expired: expires_at < now,
        })
    }
}
