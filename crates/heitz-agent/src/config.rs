//! # Agent Configuration
//!
//! One explicit configuration struct, passed into every task constructor.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     API_URL=https://backend.example/api                                │
//! │     TARGET_DEVICE_IP=192.168.1.100                                     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     --config <path>, or                                                │
//! │     ~/.config/point-reader/reader.toml (Linux)                         │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     30 s reads, 5 min sync, built-in point catalogue                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! id = "raspberry-pi-001"
//! name = "AquaticCenter-Pi-001"
//!
//! [api]
//! base_url = "https://backend.example/api"
//! token = "..."
//!
//! [bacnet]
//! local_address = "192.168.1.200/24"
//! target_address = "192.168.1.100"
//! target_device_id = 100
//!
//! [polling]
//! read_interval_secs = 30
//! simulate = false
//!
//! [sync]
//! post_interval_secs = 300
//! batch_size = 500
//!
//! [[points]]
//! name = "pool_temperature"
//! object = "analogInput:1"
//! unit = "°C"
//! description = "Pool Water Temperature"
//! ```
//!
//! ## Validation
//! [`AgentConfig::validate`] is the startup gate: any failure there aborts
//! the process before a single task is spawned.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use heitz_core::validation::{validate_points, validate_positive};
use heitz_core::{default_points, PointDescriptor, ValidationError, MAX_OBJECT_INSTANCE};

use crate::error::{AgentError, AgentResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Identity reported to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier sent with every batch, heartbeat and revision check.
    #[serde(default = "default_device_id")]
    pub id: String,

    /// Human-readable name (logged at startup).
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_id() -> String {
    "raspberry-pi-001".to_string()
}

fn default_device_name() -> String {
    "AquaticCenter-Pi-001".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: default_device_id(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// API Configuration
// =============================================================================

/// Backend connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL; endpoints such as `sensor-data` and `heartbeat` hang off it.
    ///
    /// A URL that already ends in `/sensor-data` is accepted and trimmed.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token. Required unless `logging.debug` is set.
    #[serde(default)]
    pub token: String,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: default_base_url(),
            token: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ApiConfig {
    /// Parses the base URL, normalised to end in `/` so endpoint paths join
    /// underneath it.
    ///
    /// ## Errors
    /// `AgentError::InvalidUrl` if the URL does not parse or is not http(s).
    pub fn base_url(&self) -> AgentResult<Url> {
        let trimmed = self.base_url.trim().trim_end_matches('/');
        let trimmed = trimmed.strip_suffix("/sensor-data").unwrap_or(trimmed);

        let url = Url::parse(&format!("{}/", trimmed))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(AgentError::InvalidUrl(format!(
                "API URL must use http or https, got: {}",
                other
            ))),
        }
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// BACnet Configuration
// =============================================================================

/// BACnet/IP settings. Ignored in simulation mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacnetConfig {
    /// Local interface address, optionally with a prefix length
    /// (`192.168.1.200/24`). The prefix is accepted and ignored.
    #[serde(default = "default_local_address")]
    pub local_address: String,

    /// Local UDP port.
    #[serde(default = "default_bacnet_port")]
    pub local_port: u16,

    /// Target device IP.
    #[serde(default = "default_target_address")]
    pub target_address: String,

    /// Target device UDP port.
    #[serde(default = "default_bacnet_port")]
    pub target_port: u16,

    /// Target device instance number.
    #[serde(default = "default_target_device_id")]
    pub target_device_id: u32,

    /// Per-request timeout (milliseconds).
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

fn default_local_address() -> String {
    "192.168.1.200/24".to_string()
}

fn default_bacnet_port() -> u16 {
    heitz_bacnet::DEFAULT_PORT
}

fn default_target_address() -> String {
    "192.168.1.100".to_string()
}

fn default_target_device_id() -> u32 {
    100
}

fn default_read_timeout() -> u64 {
    3000
}

impl Default for BacnetConfig {
    fn default() -> Self {
        BacnetConfig {
            local_address: default_local_address(),
            local_port: default_bacnet_port(),
            target_address: default_target_address(),
            target_port: default_bacnet_port(),
            target_device_id: default_target_device_id(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl BacnetConfig {
    /// Local socket address to bind.
    pub fn local_socket_addr(&self) -> AgentResult<SocketAddr> {
        let ip = self
            .local_address
            .split_once('/')
            .map_or(self.local_address.as_str(), |(ip, _prefix)| ip);
        parse_ip("bacnet.local_address", ip).map(|ip| SocketAddr::new(ip, self.local_port))
    }

    /// Target device socket address.
    pub fn target_socket_addr(&self) -> AgentResult<SocketAddr> {
        parse_ip("bacnet.target_address", &self.target_address)
            .map(|ip| SocketAddr::new(ip, self.target_port))
    }

    /// Per-request timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn parse_ip(field: &str, value: &str) -> AgentResult<IpAddr> {
    IpAddr::from_str(value.trim()).map_err(|_| {
        AgentError::Validation(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("'{}' is not an IP address", value),
        })
    })
}

// =============================================================================
// Task Settings
// =============================================================================

/// Sensor poller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds between read ticks.
    #[serde(default = "default_read_interval")]
    pub read_interval_secs: u64,

    /// Read from the simulated source instead of BACnet.
    #[serde(default)]
    pub simulate: bool,
}

fn default_read_interval() -> u64 {
    30
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            read_interval_secs: default_read_interval(),
            simulate: false,
        }
    }
}

/// Sync agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Seconds between sync cycles.
    #[serde(default = "default_post_interval")]
    pub post_interval_secs: u64,

    /// Readings per POST.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Upper bound on consecutive batches in one cycle.
    #[serde(default = "default_max_batches")]
    pub max_batches_per_cycle: u32,

    /// Days a posted reading is kept before pruning.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Run one last cycle after the shutdown signal.
    #[serde(default = "default_true")]
    pub flush_on_shutdown: bool,
}

fn default_post_interval() -> u64 {
    300
}

fn default_batch_size() -> u32 {
    500
}

fn default_max_batches() -> u32 {
    10
}

fn default_retention_days() -> u64 {
    7
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            post_interval_secs: default_post_interval(),
            batch_size: default_batch_size(),
            max_batches_per_cycle: default_max_batches(),
            retention_days: default_retention_days(),
            flush_on_shutdown: true,
        }
    }
}

/// Liveness reporter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_five_minutes")]
    pub interval_secs: u64,
}

fn default_five_minutes() -> u64 {
    300
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval_secs: default_five_minutes(),
        }
    }
}

/// Update agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Seconds between revision checks.
    #[serde(default = "default_five_minutes")]
    pub check_interval_secs: u64,

    /// Git checkout whose `HEAD` is the running revision. Defaults to the
    /// working directory.
    #[serde(default)]
    pub repo_dir: Option<PathBuf>,

    /// Shell command run when the backend reports a different revision.
    /// When unset, a new revision is only logged.
    #[serde(default)]
    pub command: Option<String>,

    /// Seconds the update command may run before it is killed.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    600
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            check_interval_secs: default_five_minutes(),
            repo_dir: None,
            command: None,
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// Local storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/sensor_data.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            db_path: default_db_path(),
        }
    }
}

/// Logging settings consumed by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level name (`INFO`, `debug`, ...). `RUST_LOG` takes priority.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Development mode: relaxes the API token requirement.
    #[serde(default)]
    pub debug: bool,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            debug: false,
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete reader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub bacnet: BacnetConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Points read on every tick. Defaults to the built-in catalogue.
    #[serde(default = "default_points")]
    pub points: Vec<PointDescriptor>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            device: DeviceConfig::default(),
            api: ApiConfig::default(),
            bacnet: BacnetConfig::default(),
            polling: PollingConfig::default(),
            sync: SyncSettings::default(),
            heartbeat: HeartbeatConfig::default(),
            update: UpdateConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            points: default_points(),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from file, environment, and defaults, then
    /// validates it.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (explicit path, else the platform config dir)
    /// 3. Environment variables
    ///
    /// ## Errors
    /// An explicit path that does not exist is an error; a missing file at
    /// the default location is not.
    pub fn load(config_path: Option<PathBuf>) -> AgentResult<Self> {
        let config = Self::resolve(config_path)?;
        config.validate()?;
        Ok(config)
    }

    /// Merges defaults, file and environment without validating.
    ///
    /// Lets the caller set up logging from the merged `[logging]` section
    /// before reporting validation failures.
    pub fn resolve(config_path: Option<PathBuf>) -> AgentResult<Self> {
        let mut config = match config_path {
            Some(path) => {
                if !path.exists() {
                    return Err(AgentError::ConfigLoadFailed(format!(
                        "{} does not exist",
                        path.display()
                    )));
                }
                Self::from_file(&path)?
            }
            None => match Self::default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                Some(path) => {
                    debug!(?path, "Config file not found, using defaults");
                    Self::default()
                }
                None => Self::default(),
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;

        Ok(config)
    }

    /// Parses a TOML config file.
    pub fn from_file(path: &Path) -> AgentResult<Self> {
        info!(?path, "Loading reader config from file");
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parses TOML config text.
    pub fn from_toml(contents: &str) -> AgentResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "heitz", "point-reader")
            .map(|dirs| dirs.config_dir().join("reader.toml"))
    }

    /// Applies environment variable overrides.
    ///
    /// `lookup` resolves a variable name; production passes
    /// `std::env::var`, tests pass a map.
    ///
    /// ## Errors
    /// A variable that is set but does not parse (`READ_INTERVAL=soon`) is a
    /// configuration error rather than silently ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> AgentResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.api.base_url = url;
        }
        if let Some(token) = get("API_TOKEN") {
            self.api.token = token;
        }
        if let Some(id) = get("DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }
        if let Some(name) = get("DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(ip) = get("BACNET_IP") {
            self.bacnet.local_address = ip;
        }
        if let Some(port) = get("BACNET_PORT") {
            self.bacnet.local_port = parse_env("BACNET_PORT", &port)?;
        }
        if let Some(ip) = get("TARGET_DEVICE_IP") {
            self.bacnet.target_address = ip;
        }
        if let Some(port) = get("BACNET_TARGET_PORT") {
            self.bacnet.target_port = parse_env("BACNET_TARGET_PORT", &port)?;
        }
        if let Some(id) = get("TARGET_DEVICE_ID") {
            self.bacnet.target_device_id = parse_env("TARGET_DEVICE_ID", &id)?;
        }

        if let Some(secs) = get("READ_INTERVAL") {
            self.polling.read_interval_secs = parse_env("READ_INTERVAL", &secs)?;
        }
        if let Some(flag) = get("SIMULATE_MODE") {
            self.polling.simulate = parse_bool("SIMULATE_MODE", &flag)?;
        }

        if let Some(secs) = get("POST_INTERVAL") {
            self.sync.post_interval_secs = parse_env("POST_INTERVAL", &secs)?;
        }
        if let Some(days) = get("RETENTION_DAYS") {
            self.sync.retention_days = parse_env("RETENTION_DAYS", &days)?;
        }
        if let Some(size) = get("SYNC_BATCH_SIZE") {
            self.sync.batch_size = parse_env("SYNC_BATCH_SIZE", &size)?;
        }

        if let Some(secs) = get("HEARTBEAT_INTERVAL") {
            self.heartbeat.interval_secs = parse_env("HEARTBEAT_INTERVAL", &secs)?;
        }
        if let Some(secs) = get("UPDATE_CHECK_INTERVAL") {
            self.update.check_interval_secs = parse_env("UPDATE_CHECK_INTERVAL", &secs)?;
        }
        if let Some(command) = get("UPDATE_COMMAND") {
            self.update.command = Some(command);
        }
        if let Some(secs) = get("UPDATE_COMMAND_TIMEOUT") {
            self.update.command_timeout_secs = parse_env("UPDATE_COMMAND_TIMEOUT", &secs)?;
        }

        if let Some(path) = get("DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }

        if let Some(level) = get("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(flag) = get("DEBUG") {
            self.logging.debug = parse_bool("DEBUG", &flag)?;
        }

        Ok(())
    }

    /// Validates everything the long-running service needs.
    ///
    /// ## Checks
    /// - API URL parses as http(s); token present unless in debug mode
    /// - everything [`validate_local`](Self::validate_local) checks
    pub fn validate(&self) -> AgentResult<()> {
        self.api.base_url()?;
        if self.api.token.trim().is_empty() && !self.logging.debug {
            return Err(AgentError::InvalidConfig(
                "api.token is required (set API_TOKEN, or DEBUG=true for development)".into(),
            ));
        }

        self.validate_local()
    }

    /// Validates the settings that do not involve the backend.
    ///
    /// One-shot commands (`read`, `write`, `release`, `stats`) run with just
    /// this, so a gateway without an API token can still be commissioned.
    ///
    /// ## Checks
    /// - device id present
    /// - every interval, the batch size and the timeouts are non-zero
    /// - retention at most 100 years
    /// - point list non-empty, names valid and unique, instances in range
    /// - BACnet addresses parse (skipped in simulation mode)
    pub fn validate_local(&self) -> AgentResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "device.id".to_string(),
            }
            .into());
        }

        validate_positive("api.request_timeout_secs", self.api.request_timeout_secs)?;
        validate_positive("polling.read_interval_secs", self.polling.read_interval_secs)?;
        validate_positive("sync.post_interval_secs", self.sync.post_interval_secs)?;
        validate_positive("sync.batch_size", u64::from(self.sync.batch_size))?;
        validate_positive(
            "sync.max_batches_per_cycle",
            u64::from(self.sync.max_batches_per_cycle),
        )?;
        validate_positive("heartbeat.interval_secs", self.heartbeat.interval_secs)?;
        validate_positive("update.check_interval_secs", self.update.check_interval_secs)?;
        validate_positive(
            "update.command_timeout_secs",
            self.update.command_timeout_secs,
        )?;

        // Zero keeps nothing once posted. The cap keeps the prune cutoff
        // arithmetic in range.
        if self.sync.retention_days > MAX_RETENTION_DAYS {
            return Err(ValidationError::OutOfRange {
                field: "sync.retention_days".to_string(),
                min: 0,
                max: MAX_RETENTION_DAYS as i64,
            }
            .into());
        }

        validate_points(&self.points)?;
        if let Some(point) = self
            .points
            .iter()
            .find(|p| p.object.instance > MAX_OBJECT_INSTANCE)
        {
            return Err(ValidationError::OutOfRange {
                field: format!("points.{}.object instance", point.name),
                min: 0,
                max: i64::from(MAX_OBJECT_INSTANCE),
            }
            .into());
        }

        if !self.polling.simulate {
            validate_positive("bacnet.read_timeout_ms", self.bacnet.read_timeout_ms)?;
            self.bacnet.local_socket_addr()?;
            self.bacnet.target_socket_addr()?;
            if self.bacnet.target_device_id > MAX_OBJECT_INSTANCE {
                return Err(ValidationError::OutOfRange {
                    field: "bacnet.target_device_id".to_string(),
                    min: 0,
                    max: i64::from(MAX_OBJECT_INSTANCE),
                }
                .into());
            }
        }

        Ok(())
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_secs(self.polling.read_interval_secs)
    }

    pub fn post_interval(&self) -> Duration {
        Duration::from_secs(self.sync.post_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update.check_interval_secs)
    }

    pub fn update_command_timeout(&self) -> Duration {
        Duration::from_secs(self.update.command_timeout_secs)
    }

    /// Retention window for posted readings.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.sync.retention_days.saturating_mul(24 * 60 * 60))
    }

    /// Upper bound on one point's acquisition.
    ///
    /// A commandable point costs two requests (present value and priority
    /// array), each bounded by the BACnet read timeout.
    pub fn point_timeout(&self) -> Duration {
        self.bacnet.read_timeout().saturating_mul(2)
    }
}

/// Longest accepted retention window.
pub const MAX_RETENTION_DAYS: u64 = 36_500;

fn parse_env<T: FromStr>(key: &str, value: &str) -> AgentResult<T> {
    value.trim().parse().map_err(|_| {
        AgentError::InvalidConfig(format!("{} has an invalid value: '{}'", key, value))
    })
}

fn parse_bool(key: &str, value: &str) -> AgentResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(AgentError::InvalidConfig(format!(
            "{} must be true or false, got: '{}'",
            key, value
        ))),
    }
}
