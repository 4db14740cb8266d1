use {
    anyhow::{Context as _, Result},
    byte_unit::Byte,
    serde::{Deserialize, Serialize},
    std::{
        net::SocketAddr,
        path::{Path, PathBuf},
        time::Duration,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Holds the metadata database and the blob directory.
    pub storage_path: PathBuf,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: Byte,
    #[serde(default = "default_storage_timeout", with = "humantime_serde")]
    pub storage_timeout: Duration,
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Origin allowed to call the API from a browser.
    #[serde(default)]
    pub allowed_origin: Option<String>,
}

fn default_log_filter() -> String {
    "info".into()
}

fn default_max_upload_size() -> Byte {
    Byte::from_u64(50_000_000)
}

fn default_storage_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Config {
    pub fn parse(path: &Path) -> Result<Self> {
        let text = fs_err::read_to_string(path)?;
        json5::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {super::*, tempfile::TempDir};

    #[test]
    fn defaults() {
        let config: Config = json5::from_str(
            r#"{
                // comments are allowed
                bind_addr: "127.0.0.1:8080",
                storage_path: "/var/lib/imgvault",
            }"#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.log_file, None);
        assert_eq!(config.max_upload_size.as_u64(), 50_000_000);
        assert_eq!(config.storage_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.allowed_origin, None);
    }

    #[test]
    fn explicit_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("imgvault-server.json5");
        fs_err::write(
            &path,
            r#"{
                bind_addr: "0.0.0.0:5000",
                storage_path: "data",
                log_file: "server.log",
                log_filter: "debug,sled=warn",
                max_upload_size: "2 MiB",
                storage_timeout: "5s",
                shutdown_timeout: "1m",
                allowed_origin: "http://localhost:3000",
            }"#,
        )
        .unwrap();
        let config = Config::parse(&path).unwrap();
        assert_eq!(config.max_upload_size.as_u64(), 2 * 1024 * 1024);
        assert_eq!(config.storage_timeout, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.log_file, Some(PathBuf::from("server.log")));
        assert_eq!(
            config.allowed_origin.as_deref(),
            Some("http://localhost:3000")
        );
    }

    #[test]
    fn missing_required_field() {
        json5::from_str::<Config>(r#"{ bind_addr: "127.0.0.1:8080" }"#).unwrap_err();
    }
}
