use clap::Parser;
use tracing_subscriber::EnvFilter;

use ethersweep_runtime::config::{Args, NodeConfig};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Setup logging (defaults to info; RUST_LOG=debug shows display frames)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Never returns; the node runs until power is removed
    ethersweep_runtime::runtime::run(NodeConfig::from(args)).await;
}
