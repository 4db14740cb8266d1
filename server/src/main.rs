use {
    anyhow::Result,
    clap::Parser,
    imgvault_server::{Config, util::{default_config_path, setup_logger}},
    std::path::PathBuf,
    tracing::info,
};

/// Encrypted image storage server.
#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct Cli {
    /// Path to the json5 config file.
    #[clap(long)]
    pub config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = Config::parse(&config_path)?;
    setup_logger(config.log_file.as_deref(), &config.log_filter)?;
    info!(config = %config_path.display(), "starting imgvault server");
    imgvault_server::run(config).await
}
