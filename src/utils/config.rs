use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File consulted when `BACKUP_CONFIG` is not set; any format the `config`
/// crate understands (`backup-profiles.toml`, `.json`, ...).
const DEFAULT_CONFIG_NAME: &str = "backup-profiles";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Address the control API binds to
    pub host: String,

    /// Server port
    pub port: u16,

    /// Where profiles are persisted
    pub settings_path: PathBuf,

    /// Synchronization tool, looked up on PATH
    pub rsync_binary: String,

    /// Buffered events per subscriber before it starts lagging
    pub event_capacity: usize,

    /// Output lines kept for the logs endpoint
    pub log_buffer_size: usize,

    /// "pretty" or "json"
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        let settings_path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("backup-profiles")
            .join("settings.json");

        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            settings_path,
            rsync_binary: "rsync".to_string(),
            event_capacity: 1024,
            log_buffer_size: 1000,
            log_format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then the optional config file, then `BACKUP_*` variables.
    pub fn load() -> Result<Self> {
        let file = std::env::var("BACKUP_CONFIG").ok();
        Self::load_from(file.as_deref().map(Path::new))
    }

    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let file_source = match file {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(file_source)
            .add_source(config::Environment::with_prefix("BACKUP"))
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize::<Config>()
            .context("Invalid configuration")?;

        if config.event_capacity == 0 {
            anyhow::bail!("event_capacity must be greater than zero");
        }

        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
