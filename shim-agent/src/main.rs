//! Shim Agent Binary Entry Point

use clap::Parser;
use shim_agent::logging::{init_logging, LoggingConfig};
use shim_agent::{load_config, run_agent, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _guard = init_logging(&LoggingConfig {
        json_format: args.log_json,
        log_dir: args.log_dir.clone(),
        ..Default::default()
    })?;

    let config = load_config(&args, std::env::vars())?;

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, stopping proxy server...");
        }
    };

    if let Err(e) = run_agent(config, shutdown).await {
        tracing::error!("Shim agent failed: {:#}", e);
        return Err(e);
    }

    Ok(())
}
