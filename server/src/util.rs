use {
    anyhow::Result,
    fs_err::{OpenOptions, create_dir_all},
    std::{
        io::{self, Write},
        path::{Path, PathBuf},
        sync::Mutex,
    },
    tracing_subscriber::{EnvFilter, prelude::*},
};

pub const CONFIG_FILE_NAME: &str = "imgvault-server.json5";

fn log_writer(log_file: Option<&Path>) -> Result<Box<dyn Write + Send>> {
    let Some(path) = log_file else {
        return Ok(Box::new(io::stdout()));
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Box::new(file))
}

/// Logs to `log_file` (appending) or to stdout.
pub fn setup_logger(log_file: Option<&Path>, log_filter: &str) -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(log_file.is_none())
        .with_writer(Mutex::new(log_writer(log_file)?));
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::try_new(log_filter)?)
        .try_init()?;
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn default_config_dir() -> Result<PathBuf> {
    Ok("/etc".into())
}

// Windows: %APPDATA% (%USERPROFILE%\AppData\Roaming);
// macOS: $HOME/Library/Application Support
#[cfg(not(target_os = "linux"))]
pub fn default_config_dir() -> Result<PathBuf> {
    dirs::config_dir().ok_or_else(|| anyhow::anyhow!("failed to get config dir"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join(CONFIG_FILE_NAME))
}
