//! Target version selection

use stride_common::{CodeVersion, Error, Result};

use crate::package::{GoalStateModel, PackageDetails};

/// Outcome of a selection walk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    /// Furthest reachable version; equals the running version if none is reachable
    pub target: CodeVersion,
    /// Packages to provision, in hop order
    pub path: Vec<PackageDetails>,
}

impl Selection {
    /// True if the walk moved past the running version
    pub fn is_upgrade(&self) -> bool {
        !self.path.is_empty()
    }
}

/// Walk the manifest from `current` to the furthest reachable version.
///
/// Each hop takes the highest eligible package: not upgrade-disabled, with
/// `min_version <= v < version`. The walk stops at a version whose own entry
/// is upgrade-disabled. The execution service is later asked to jump
/// directly to the target; every hop is provisioned on the way.
pub fn select_target(current: &CodeVersion, model: &GoalStateModel) -> Selection {
    let mut version = current.clone();
    let mut path: Vec<PackageDetails> = Vec::new();

    loop {
        if model
            .entry(&version)
            .map(|e| e.is_upgrade_disabled)
            .unwrap_or(false)
        {
            break;
        }

        let next = model
            .packages
            .iter()
            .filter(|p| p.accepts_upgrade_from(&version))
            .max_by(|a, b| a.version.cmp(&b.version));

        match next {
            Some(next) => {
                version = next.version.clone();
                path.push(next.clone());
            }
            None => break,
        }
    }

    Selection {
        target: version,
        path,
    }
}

/// Direction of a user-requested code version change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionChange {
    /// Moving to a newer version
    Upgrade,
    /// Moving to an older version
    Downgrade,
}

/// Check that a user may move the cluster from `current` to `requested`
///
/// Downgrades are single jumps, refused when the running package disables
/// them; they are never walked.
pub fn validate_requested_version(
    current: &CodeVersion,
    requested: &CodeVersion,
    model: &GoalStateModel,
) -> Result<VersionChange> {
    let target = model.entry(requested).ok_or_else(|| {
        Error::validation(format!("version {} is not a published package", requested))
    })?;

    if requested == current {
        return Err(Error::validation(format!(
            "cluster already runs version {}",
            current
        )));
    }

    if requested > current {
        if target.is_upgrade_disabled {
            return Err(Error::validation(format!(
                "upgrading to version {} is disabled",
                requested
            )));
        }
        if target.min_version > *current {
            return Err(Error::validation(format!(
                "version {} requires at least {} to upgrade from, cluster runs {}",
                requested, target.min_version, current
            )));
        }
        return Ok(VersionChange::Upgrade);
    }

    if model
        .entry(current)
        .map(|e| e.is_downgrade_disabled)
        .unwrap_or(false)
    {
        return Err(Error::validation(format!(
            "downgrading from version {} is disabled",
            current
        )));
    }
    Ok(VersionChange::Downgrade)
}
