//! Offline goal-state manifest inspection

use std::path::PathBuf;

use chrono::Utc;
use clap::{Args, Subcommand};
use stride_common::CodeVersion;
use stride_goalstate::{select_target, GoalStateModel, PackageSet};

use super::read_file;
use crate::{Error, Result};

#[derive(Subcommand, Debug)]
pub enum GoalStateCommand {
    /// Compute the target version and provisioning path from a running version
    Select(SelectArgs),
    /// List published packages
    Packages(PackagesArgs),
}

#[derive(Args, Debug)]
pub struct SelectArgs {
    /// Running code version
    #[arg(long)]
    pub current: CodeVersion,

    /// Goal-state manifest file
    #[arg(long)]
    pub manifest: PathBuf,
}

#[derive(Args, Debug)]
pub struct PackagesArgs {
    /// Goal-state manifest file
    #[arg(long)]
    pub manifest: PathBuf,

    /// Which packages to list (all, supported, latest)
    #[arg(long, default_value = "supported")]
    pub set: String,
}

pub async fn run(command: GoalStateCommand) -> Result<String> {
    match command {
        GoalStateCommand::Select(args) => {
            let model = GoalStateModel::parse(&read_file(&args.manifest)?)?;
            let selection = select_target(&args.current, &model);
            let path: Vec<String> = selection.path.iter().map(|p| p.version.to_string()).collect();
            Ok(serde_json::to_string_pretty(&serde_json::json!({
                "current": args.current.to_string(),
                "target": selection.target.to_string(),
                "path": path,
            }))?)
        }
        GoalStateCommand::Packages(args) => {
            let set: PackageSet = args.set.parse().map_err(|e: stride_common::Error| {
                Error::invalid_argument(e.to_string())
            })?;
            let model = GoalStateModel::parse(&read_file(&args.manifest)?)?;
            let packages = model.packages(set, Utc::now())?;
            Ok(serde_json::to_string_pretty(&packages)?)
        }
    }
}
