mod app;
mod config;
mod supplier;
mod upstream;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Optional first argument: path to the config file.
    let config = match std::env::args_os().nth(1) {
        Some(path) => Config::load_from(PathBuf::from(path))?,
        None => Config::load()?,
    };

    tracing::info!(config = %config.file_path().display(), "devgate gateway starting");
    app::run(config).await
}
