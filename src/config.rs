use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::Context as _;
use serde::Deserialize;
use std::str::FromStr;

pub const PROJECT_CONFIG_FILENAME: &str = "mockdb.toml";
pub const DEFAULT_DB_PATH: &str = ".mockdb/console.db";
const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";
const DEFAULT_REVALIDATE_AFTER_MS: u64 = 250;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Network flags read by the interception layer on every request.
pub type SharedNetworkConfig = Arc<RwLock<NetworkConfig>>;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&toml)
            .with_context(|| format!("load config {}", path.display()))?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Loads `override_path` if given, else `./mockdb.toml`, else
    /// `$HOME/.mockdb/config.toml`, else the built-in defaults.
    pub fn discover(override_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = override_path {
            return Self::from_path(path);
        }

        let project = PathBuf::from(PROJECT_CONFIG_FILENAME);
        if project.is_file() {
            return Self::from_path(project);
        }

        if let Some(home) = env::var_os("HOME") {
            let home_config = PathBuf::from(home).join(".mockdb").join("config.toml");
            if home_config.is_file() {
                return Self::from_path(home_config);
            }
        }

        Ok(Self::default())
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn shared_network(&self) -> SharedNetworkConfig {
        Arc::new(RwLock::new(self.network.clone()))
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub in_memory: bool,
    #[serde(default = "default_revalidate_after_ms")]
    pub revalidate_after_ms: u64,
    /// How long a write waits on another process's lock before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl StorageConfig {
    pub fn revalidate_after(&self) -> Duration {
        Duration::from_millis(self.revalidate_after_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            in_memory: false,
            revalidate_after_ms: DEFAULT_REVALIDATE_AFTER_MS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_true")]
    pub use_mock_data: bool,
    #[serde(default)]
    pub capture_responses: bool,
    #[serde(default = "default_true")]
    pub log_network_traffic: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            use_mock_data: true,
            capture_responses: false,
            log_network_traffic: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_owned()
}

fn default_revalidate_after_ms() -> u64 {
    DEFAULT_REVALIDATE_AFTER_MS
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use super::{Config, LogFormat};

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();

        assert_eq!(config.storage.path, Path::new(".mockdb/console.db"));
        assert!(!config.storage.in_memory);
        assert_eq!(config.storage.revalidate_after(), Duration::from_millis(250));
        assert_eq!(config.storage.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.network.api_base_url, "http://localhost:3000/api");
        assert!(config.network.use_mock_data);
        assert!(!config.network.capture_responses);
        assert!(config.network.log_network_traffic);
        assert!(config.logging.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
[storage]
path = "/tmp/console.db"
revalidate_after_ms = 500
busy_timeout_ms = 100

[network]
api_base_url = "https://api.example.com/v2"
capture_responses = true
log_network_traffic = false

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .unwrap();

        assert_eq!(config.storage.path, Path::new("/tmp/console.db"));
        assert_eq!(config.storage.revalidate_after(), Duration::from_millis(500));
        assert_eq!(config.storage.busy_timeout(), Duration::from_millis(100));
        assert_eq!(config.network.api_base_url, "https://api.example.com/v2");
        assert!(config.network.use_mock_data);
        assert!(config.network.capture_responses);
        assert!(!config.network.log_network_traffic);
        let logging = config.logging.unwrap();
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn invalid_toml_is_reported() {
        let err = Config::from_toml_str("[network\n").unwrap_err();
        assert!(err.to_string().contains("parse config TOML"), "{err}");
    }

    #[test]
    fn explicit_path_is_recorded_as_source() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("custom.toml");
        std::fs::write(&path, "[storage]\nin_memory = true\n").unwrap();

        let config = Config::discover(Some(&path)).unwrap();
        assert!(config.storage.in_memory);
        assert_eq!(config.source_path(), Some(path.as_path()));
    }
}
