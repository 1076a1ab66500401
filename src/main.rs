//! Helmsman - supervised multi-step task orchestration
//!
//! CLI entry point.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod adapters;
mod cli;
mod config;
mod engine;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = cli::Cli::parse();

    match start(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<helmsman_core::Error>() {
                Some(core) => eprintln!("\n❌ {}", helmsman_core::format_error_for_cli(core)),
                None => eprintln!("\n❌ {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn start(cli: cli::Cli) -> Result<()> {
    let config = config::load_config()?;

    let json = config.logging.json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "helmsman=info,helmsman_core=info,helmsman_memory=info".into()
            }),
        )
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    if cli.command.is_some() {
        info!("Starting Helmsman v{}", env!("CARGO_PKG_VERSION"));
    }

    cli::run(cli, config).await
}
