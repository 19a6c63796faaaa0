#![deny(clippy::all, clippy::pedantic)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = ssbo_runtime::Args::parse();
    let summary = ssbo_runtime::run(&args)?;
    tracing::info!("done: {summary:?}");
    Ok(())
}
