//! stride CLI library
//!
//! Every command returns the text to print so it can be exercised without a
//! terminal.

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// stride - rolling upgrade orchestration for a cluster
#[derive(Parser, Debug)]
#[command(name = "stride")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Orchestrator configuration file (YAML)
    #[arg(long, global = true, env = "STRIDE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the persisted records; overrides the configuration
    #[arg(long, global = true, env = "STRIDE_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Seed the cluster state from a configuration document
    Init(commands::init::InitArgs),
    /// Request a configuration upgrade
    StartConfigUpgrade(commands::upgrade::ConfigUpgradeArgs),
    /// Request a code upgrade
    StartCodeUpgrade(commands::upgrade::CodeUpgradeArgs),
    /// Show upgrade status as JSON
    Status,
    /// Print the applied configuration document
    GetConfig(commands::status::GetConfigArgs),
    /// Inspect a goal-state manifest offline
    #[command(subcommand)]
    GoalState(commands::goal_state::GoalStateCommand),
}

impl Cli {
    /// Run the CLI command and return its output
    pub async fn run(self) -> Result<String> {
        let open = || commands::Environment::open(self.config.as_deref(), self.data_root.clone());
        match self.command {
            Commands::Init(args) => commands::init::run(args, &open()?).await,
            Commands::StartConfigUpgrade(args) => commands::upgrade::run_config(args, &open()?).await,
            Commands::StartCodeUpgrade(args) => commands::upgrade::run_code(args, &open()?).await,
            Commands::Status => commands::status::run_status(&open()?).await,
            Commands::GetConfig(args) => commands::status::run_get_config(args, &open()?).await,
            Commands::GoalState(cmd) => commands::goal_state::run(cmd).await,
        }
    }
}
