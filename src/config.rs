use crate::prelude::*;

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::sync::Arc;
use std::time::Duration;

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_station_file")]
    pub station_file: String,

    /// Minimum wall-clock time between the starts of two poll cycles
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_cadence", rename = "cadence_secs")]
    pub cadence: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_timeout", rename = "connect_timeout_secs")]
    pub connect_timeout: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_timeout", rename = "read_timeout_secs")]
    pub read_timeout: Duration,

    #[serde(default = "Config::default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    #[serde(default)]
    pub concurrent: bool,

    pub use_tcp_nodelay: Option<bool>,

    #[serde(default = "Config::default_enabled")]
    pub log_line: bool,

    /// Optional path to write decoded records to in JSON lines format
    pub datalog_file: Option<String>,

    #[serde(default = "Vec::new")]
    pub databases: Vec<Database>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Database {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Database {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub url: String,
}
impl Database {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn url(&self) -> &str {
        &self.url
    }
} // }}}

impl Default for Config {
    fn default() -> Self {
        Self {
            station_file: Self::default_station_file(),
            cadence: Self::default_cadence(),
            connect_timeout: Self::default_timeout(),
            read_timeout: Self::default_timeout(),
            max_frame_bytes: Self::default_max_frame_bytes(),
            concurrent: false,
            use_tcp_nodelay: None,
            log_line: true,
            datalog_file: None,
            databases: Vec::new(),
            loglevel: Self::default_loglevel(),
        }
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error!("error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.station_file.is_empty() {
            bail!("station_file cannot be empty");
        }
        if self.cadence.is_zero() {
            bail!("cadence_secs must be at least 1");
        }
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            bail!("connect_timeout_secs and read_timeout_secs must be at least 1");
        }
        if self.max_frame_bytes < 16 {
            bail!("max_frame_bytes must be at least 16");
        }
        if self.loglevel.parse::<log::LevelFilter>().is_err() {
            return Err(file_error!("invalid loglevel {}", self.loglevel));
        }

        for (i, db) in self.databases.iter().enumerate() {
            if db.enabled {
                let url = url::Url::parse(db.url())
                    .map_err(|e| file_error_with_source!(e, "databases[{}]: invalid URL", i))?;
                if url.scheme() != "sqlite" {
                    return Err(file_error!("databases[{}]: unsupported database {}", i, db.url()));
                }
            }
        }

        Ok(())
    }

    /// Logs the effective configuration; called once logging is up.
    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Station list: {}", self.station_file);
        info!("  Cadence: {}s", self.cadence.as_secs());
        info!("  Connect Timeout: {}s", self.connect_timeout.as_secs());
        info!("  Read Timeout: {}s", self.read_timeout.as_secs());
        info!("  Max Frame Bytes: {}", self.max_frame_bytes);
        info!("  Concurrent: {}", self.concurrent);
        info!("  TCP NoDelay: {}", self.use_tcp_nodelay.unwrap_or(true));
        info!("  Log Line: {}", if self.log_line { "enabled" } else { "disabled" });
        info!("  Datalog File: {}", self.datalog_file.as_deref().unwrap_or("disabled"));
        info!(
            "  Databases: {} configured, {} enabled",
            self.databases.len(),
            self.databases.iter().filter(|d| d.enabled).count()
        );
        for (i, db) in self.databases.iter().enumerate() {
            info!("    Database[{}]: {} ({})", i, db.url, if db.enabled { "enabled" } else { "disabled" });
        }
        info!("  Log Level: {}", self.loglevel);
    }

    fn default_station_file() -> String {
        "StationList.txt".to_string()
    }

    fn default_cadence() -> Duration {
        Duration::from_secs(60)
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(30)
    }

    fn default_max_frame_bytes() -> usize {
        1024
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}

/// Cheap to clone, read-only view of the loaded configuration.
#[derive(Clone, Debug)]
pub struct ConfigWrapper {
    config: Arc<Config>,
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn station_file(&self) -> &str {
        &self.config.station_file
    }

    pub fn cadence(&self) -> Duration {
        self.config.cadence
    }

    pub fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.config.read_timeout
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.config.max_frame_bytes
    }

    pub fn concurrent(&self) -> bool {
        self.config.concurrent
    }

    pub fn use_tcp_nodelay(&self) -> bool {
        self.config.use_tcp_nodelay.unwrap_or(true)
    }

    pub fn log_line(&self) -> bool {
        self.config.log_line
    }

    pub fn datalog_file(&self) -> Option<&str> {
        self.config.datalog_file.as_deref()
    }

    fn databases(&self) -> &[Database] {
        &self.config.databases
    }

    pub fn enabled_databases(&self) -> impl Iterator<Item = &Database> {
        self.databases().iter().filter(|d| d.enabled())
    }

    pub fn loglevel(&self) -> &str {
        &self.config.loglevel
    }

    pub fn log_summary(&self) {
        self.config.log_summary()
    }
}
