//! Order Worker - Entry Point
//!
//! Runs the order pipeline consumers selected on the command line.

use clap::Parser;
use integrahub_order_worker::Cli;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    integrahub_order_worker::run(Cli::parse()).await
}
