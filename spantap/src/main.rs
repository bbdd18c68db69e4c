use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{self, EnvFilter};

#[derive(Debug, Parser)]
struct Opt {
    /// Enable verbose output (sets log level to INFO)
    #[clap(short, long)]
    verbose: bool,

    /// Path to the YAML configuration file (also via SPANTAP_CONFIG)
    #[clap(short, long, env = "SPANTAP_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    // RUST_LOG wins; otherwise --verbose selects 'info', default is 'warn'.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if opt.verbose { "info" } else { "warn" })),
        )
        .init();

    dotenvy::dotenv().ok();
    let settings = spantap::settings::Settings::load(opt.config.as_deref())
        .context("Failed to load settings")?;

    // Configuration problems surface here, before any pipeline stage runs.
    let engine = spantap::Engine::new(settings)?;
    engine.run().await?;

    Ok(())
}
