//! Upgrade request commands

use std::path::PathBuf;

use clap::Args;
use stride_common::CodeVersion;
use stride_goalstate::GoalStateModel;

use super::{read_file, Environment};
use crate::Result;

#[derive(Args, Debug)]
pub struct ConfigUpgradeArgs {
    /// New configuration document
    pub document: PathBuf,
}

#[derive(Args, Debug)]
pub struct CodeUpgradeArgs {
    /// Code version to move to
    pub version: CodeVersion,

    /// Goal-state manifest to validate the version against
    #[arg(long)]
    pub manifest: Option<PathBuf>,
}

pub async fn run_config(args: ConfigUpgradeArgs, env: &Environment) -> Result<String> {
    let document = read_file(&args.document)?;
    env.admin.start_configuration_upgrade(&document).await?;
    Ok("configuration upgrade requested".to_string())
}

pub async fn run_code(args: CodeUpgradeArgs, env: &Environment) -> Result<String> {
    let model = match &args.manifest {
        Some(path) => Some(GoalStateModel::parse(&read_file(path)?)?),
        None => None,
    };
    env.admin
        .start_code_upgrade(args.version.clone(), model.as_ref())
        .await?;
    Ok(format!("code upgrade to {} requested", args.version))
}
