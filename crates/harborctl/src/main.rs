use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod context;
mod logging;
mod mcp;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;

    let parsed = cli::Cli::parse();
    parsed.dispatch().await
}
