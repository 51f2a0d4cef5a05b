//! Init command

use std::path::PathBuf;

use clap::Args;
use stride_cluster::WrpConfig;
use stride_common::CodeVersion;
use stride_orchestrator::ReleasePackage;

use super::{read_file, Environment};
use crate::{Error, Result};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Configuration document the cluster currently runs
    pub document: PathBuf,

    /// Code version the cluster currently runs
    #[arg(long)]
    pub code_version: Option<CodeVersion>,

    /// Release package the cluster was deployed from; supplies the code version
    #[arg(long)]
    pub package: Option<PathBuf>,
}

pub async fn run(args: InitArgs, env: &Environment) -> Result<String> {
    let document = read_file(&args.document)?;
    let wrp = match (&args.package, args.code_version) {
        (Some(path), _) => {
            let package: ReleasePackage = serde_json::from_str(&read_file(path)?)?;
            package.to_wrp_config()
        }
        (None, Some(code_version)) => WrpConfig {
            version: code_version.to_string(),
            code_version,
            is_user_initiated: false,
            settings: Vec::new(),
        },
        (None, None) => {
            return Err(Error::invalid_argument(
                "either --code-version or --package is required",
            ))
        }
    };

    let resource = env
        .admin
        .initialize(&env.config.cluster_id, &document, wrp)
        .await?;
    Ok(format!(
        "initialized cluster {} at code version {}, configuration {}",
        resource.cluster_id,
        resource.current.external_state.code_version,
        resource.current.external_state.config_version()
    ))
}
