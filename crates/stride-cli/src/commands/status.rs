//! Status and configuration queries

use clap::Args;

use super::Environment;
use crate::Result;

#[derive(Args, Debug)]
pub struct GetConfigArgs {
    /// API version of the returned document
    #[arg(long)]
    pub api_version: Option<String>,
}

pub async fn run_status(env: &Environment) -> Result<String> {
    let status = env.admin.get_upgrade_status().await?;
    Ok(serde_json::to_string_pretty(&status)?)
}

pub async fn run_get_config(args: GetConfigArgs, env: &Environment) -> Result<String> {
    Ok(env
        .admin
        .get_current_configuration(args.api_version.as_deref())
        .await?)
}
