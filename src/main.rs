mod auth;
mod cli;
mod config;
mod error;
mod pty;
mod session;
mod web;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use auth::HttpAuthProvider;
use cli::Cli;
use config::Config;
use session::store::TabStore;
use session::Registry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(cli.log_directive().parse()?),
        )
        .init();

    let config_path = match &cli.config {
        Some(path) => PathBuf::from(path),
        None => config::default_config_path()?,
    };
    let mut config = Config::load(&config_path)?;
    cli.apply(&mut config);

    let data_dir = config.data_dir()?;
    config::ensure_dirs(&data_dir)?;

    let registry = Registry::new(config.clone(), TabStore::new(data_dir));
    let auth: Arc<dyn auth::AuthProvider> = Arc::new(HttpAuthProvider::new(&config.auth)?);

    web::server::start_server(&config, registry, auth).await
}
