//! StreamDigest CLI — build a weekly streaming newsletter.
//!
//! Fetches the streaming calendar for a date range, generates tagline,
//! intro and banner candidates, lets the operator pick one of each, and
//! writes the finished newsletter.

mod commands;
mod flow;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
