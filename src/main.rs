use std::path::PathBuf;

use ::tracing::{info_span, Instrument};
use anyhow::Result;
use clap::Parser;
use cli::{Commands, OutputFormat};
use config::InventoryConfig;
use service::Service;

mod cli;
mod config;
mod service;
mod tracing;

#[derive(Parser)]
#[command(
    version,
    about = "GPU inventory and allocation engine",
    long_version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("VERGEN_BUILD_TIMESTAMP"), ")"),
    long_about = None
)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        output,
        command,
    } = Cli::parse();
    let config = match config {
        Some(path) => InventoryConfig::from_path(&path)?,
        None => InventoryConfig::default(),
    };
    crate::tracing::setup_tracing(&config);

    let root_span = info_span!("gpu-inventory", env = %config.env);
    let rendered = async move {
        let service = Service::new(config).await?;
        command.run(&service).await
    }
    .instrument(root_span)
    .await?;

    println!("{}", output.render(&rendered)?);
    Ok(())
}
