use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_local_path")]
    pub local_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// Prefix of the download URLs written into derived environments
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

/// When zero-reference blobs are physically erased
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GcMode {
    /// Erased in the same unit of work that drops the count to zero
    #[default]
    Eager,
    /// Kept at zero until the periodic sweep runs
    Deferred,
}

impl FromStr for GcMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "eager" => Ok(GcMode::Eager),
            "deferred" => Ok(GcMode::Deferred),
            other => Err(format!("unknown GC mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcConfig {
    #[serde(default)]
    pub mode: GcMode,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Decompressed bytes one AASX package may unpack to
    #[serde(default = "default_max_unpacked_bytes")]
    pub max_unpacked_bytes: u64,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "data/aasx-store.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout() -> u64 {
    5
}

fn default_local_path() -> String {
    "data/uploads".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_sweep_interval() -> u64 {
    300 // 5 minutes
}

fn default_max_body_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_max_unpacked_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_path: default_local_path(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            mode: GcMode::default(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            max_unpacked_bytes: default_max_unpacked_bytes(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.normalize();
        config.ensure_directories()?;
        tracing::info!(
            "Storage config: local_path={}, gc_mode={:?}, base_url={}",
            config.storage.local_path,
            config.gc.mode,
            config.download.base_url
        );
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    /// Load configuration from conf.ini or config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["conf.ini", "config.toml", "data/conf.ini", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: AASX_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Ok(val) = env::var("AASX_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = env::var("AASX_CONF_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        // Database overrides
        if let Ok(val) = env::var("AASX_CONF_DATABASE_PATH") {
            self.database.path = val;
        }
        if let Ok(val) = env::var("AASX_CONF_DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                self.database.max_connections = n;
            }
        }

        if let Ok(val) = env::var("AASX_CONF_DATABASE_BUSY_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                self.database.busy_timeout_secs = secs;
            }
        }

        // Storage overrides
        if let Ok(val) = env::var("AASX_CONF_STORAGE_LOCAL_PATH") {
            self.storage.local_path = val;
        }

        // Download overrides
        if let Ok(val) = env::var("AASX_CONF_DOWNLOAD_BASE_URL") {
            if !val.trim().is_empty() {
                self.download.base_url = val;
            }
        }

        // GC overrides
        if let Ok(val) = env::var("AASX_CONF_GC_MODE") {
            match val.parse::<GcMode>() {
                Ok(mode) => self.gc.mode = mode,
                Err(e) => tracing::warn!("Ignoring AASX_CONF_GC_MODE: {}", e),
            }
        }
        if let Ok(val) = env::var("AASX_CONF_GC_SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                self.gc.sweep_interval_secs = secs;
            }
        }

        // Upload overrides
        if let Ok(val) = env::var("AASX_CONF_UPLOAD_MAX_BODY_BYTES") {
            if let Ok(n) = val.parse() {
                self.upload.max_body_bytes = n;
            }
        }
        if let Ok(val) = env::var("AASX_CONF_UPLOAD_MAX_UNPACKED_BYTES") {
            if let Ok(n) = val.parse() {
                self.upload.max_unpacked_bytes = n;
            }
        }
    }

    fn normalize(&mut self) {
        let trimmed = self.download.base_url.trim_end_matches('/').to_string();
        self.download.base_url = if trimmed.is_empty() {
            default_base_url()
        } else {
            trimmed
        };
        if self.gc.sweep_interval_secs == 0 {
            self.gc.sweep_interval_secs = default_sweep_interval();
        }
        if self.database.max_connections == 0 {
            self.database.max_connections = default_max_connections();
        }
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        // Ensure database directory exists
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }

        // Ensure local storage directory exists
        fs::create_dir_all(&self.storage.local_path)?;

        Ok(())
    }
}
