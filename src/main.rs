//! reef-orchestrator CLI entrypoint

use anyhow::Result;
use clap::Parser;

use reef_orchestrator::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI, then install logging for the chosen command
    let cli = Cli::parse();
    cli.init_logging()?;
    cli.execute().await
}
