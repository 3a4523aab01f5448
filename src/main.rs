use std::path::PathBuf;
use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use gsm_endpoint::app::AppHandles;
use gsm_endpoint::config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "gsm-endpoint")]
#[command(about = "GSM modem endpoint: calls, SMS and USSD over AT commands")]
#[command(version = env!("VERSION"))]
struct CliArgs {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "GSM_ENDPOINT_CONFIG", default_value = "config.toml")]
    config: PathBuf
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let args = CliArgs::parse();
    let config = AppConfig::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into())
        )
        .init();

    info!("Starting gsm-endpoint {} with {} interface(s)", env!("VERSION"), config.interfaces.len());
    let handles = match AppHandles::create(config).await {
        Ok(handles) => handles,
        Err(e) => {
            error!("Failed to start: {:#}", e);
            return Err(e);
        }
    };

    handles.run().await;
    Ok(())
}
