//! stride CLI
//!
//! Administers the persisted state of a stride-orchestrated cluster.

use clap::Parser;
use stride_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

use stride_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        service_name: "stride-cli".to_string(),
        format: LogFormat::Compact,
        default_filter: "warn,stride=info".to_string(),
    })?;

    let cli = Cli::parse();
    let output = cli.run().await?;
    if !output.is_empty() {
        println!("{}", output);
    }
    Ok(())
}
