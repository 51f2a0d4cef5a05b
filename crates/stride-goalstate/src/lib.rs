//! Goal-state release manifests
//!
//! A goal-state manifest lists the published code versions with their
//! upgrade eligibility. [`select_target`] walks it from the running version
//! to the furthest reachable one; [`GoalStateSource`] fetches it.

pub mod client;
pub mod package;
pub mod selector;

pub use client::{GoalStateSource, HttpGoalStateClient};
pub use package::{ExpiryWarning, GoalStateModel, PackageDetails, PackageSet};
pub use selector::{select_target, validate_requested_version, Selection, VersionChange};
