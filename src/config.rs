//! Configuration management for CrabShip

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Default dial timeout (10 s).
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Default period between dial retries while disconnected (10 s).
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
/// Default staging buffer size. Reserved for a future in-memory stage and
/// currently unused beyond validation.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Configuration errors surfaced at provision time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid address {0:?}: expected host:port with exactly one port")]
    InvalidAddress(String),
    #[error("unknown sub-directive {0:?}")]
    UnknownDirective(String),
    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),
    #[error("directive {0:?} expects an argument")]
    MissingArgument(&'static str),
    #[error("missing address")]
    MissingAddress,
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("unclosed directive block")]
    UnclosedBlock,
    #[error("reconnect_interval must be greater than zero")]
    ZeroReconnectInterval,
    #[error("buffer_size must be greater than zero")]
    ZeroBufferSize,
}

/// Runtime options for one network writer instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetWriterConfig {
    /// Remote destination as `host:port`.
    pub address: String,
    /// Maximum time for a single dial attempt. Zero disables the limit.
    pub dial_timeout: Duration,
    /// Defer initial connection errors to the background reconnect loop.
    pub soft_start: bool,
    /// Period between dial retries while disconnected.
    pub reconnect_interval: Duration,
    /// Reserved for a future in-memory staging area.
    pub buffer_size: usize,
}

impl NetWriterConfig {
    /// Options for `address` with every other field at its default.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            soft_start: false,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Parse a `net` directive block:
    ///
    /// ```text
    /// net <address> {
    ///     dial_timeout <duration>
    ///     soft_start
    ///     reconnect_interval <duration>
    /// }
    /// ```
    ///
    /// The block is optional. Unknown sub-directives are rejected with an
    /// error naming the offending token.
    pub fn parse_directive(input: &str) -> Result<Self, ConfigError> {
        let tokens = tokenize(input);
        let mut tokens = tokens.iter();

        match tokens.next() {
            Some(token) if token == "net" => {}
            Some(token) => return Err(ConfigError::UnexpectedToken(token.clone())),
            None => return Err(ConfigError::MissingAddress),
        }

        let address = match tokens.next() {
            Some(token) if token != "{" && token != "}" => token.clone(),
            _ => return Err(ConfigError::MissingAddress),
        };
        let mut config = Self::new(address);

        match tokens.next() {
            None => {}
            Some(token) if token == "{" => loop {
                match tokens.next().map(String::as_str) {
                    None => return Err(ConfigError::UnclosedBlock),
                    Some("}") => {
                        if let Some(extra) = tokens.next() {
                            return Err(ConfigError::UnexpectedToken(extra.clone()));
                        }
                        break;
                    }
                    Some("dial_timeout") => {
                        let arg = tokens
                            .next()
                            .ok_or(ConfigError::MissingArgument("dial_timeout"))?;
                        config.dial_timeout = parse_duration(arg)?;
                    }
                    Some("reconnect_interval") => {
                        let arg = tokens
                            .next()
                            .ok_or(ConfigError::MissingArgument("reconnect_interval"))?;
                        config.reconnect_interval = parse_duration(arg)?;
                    }
                    Some("soft_start") => config.soft_start = true,
                    Some("buffer_size") => {
                        let arg = tokens
                            .next()
                            .ok_or(ConfigError::MissingArgument("buffer_size"))?;
                        config.buffer_size = arg
                            .parse()
                            .map_err(|_| ConfigError::InvalidNumber(arg.clone()))?;
                    }
                    Some(other) => return Err(ConfigError::UnknownDirective(other.to_string())),
                }
            },
            Some(token) => return Err(ConfigError::UnexpectedToken(token.clone())),
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate address shape and parameter ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (host, port) = self
            .address
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidAddress(self.address.clone()))?;
        if host.is_empty() || port.is_empty() || port.contains(':') {
            return Err(ConfigError::InvalidAddress(self.address.clone()));
        }
        match port.parse::<u16>() {
            Ok(0) | Err(_) => return Err(ConfigError::InvalidAddress(self.address.clone())),
            Ok(_) => {}
        }

        if self.reconnect_interval.is_zero() {
            return Err(ConfigError::ZeroReconnectInterval);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        Ok(())
    }
}

fn tokenize(input: &str) -> Vec<String> {
    input
        .replace('{', " { ")
        .replace('}', " } ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Parse a duration literal such as `10s`, `250ms`, `1m` or `2h`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::InvalidDuration(input.to_string()))?;
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(input.to_string()))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(ConfigError::InvalidDuration(input.to_string())),
    }
}

/// CrabShip application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for durable state; WALs live under
    /// `<data_dir>/wal/netwriter/<address>`.
    pub data_dir: String,
    /// Network writer settings.
    pub shipper: ShipperConfigToml,
    /// WAL tuning.
    pub wal: WalConfigToml,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Shipper configuration from TOML (durations in milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipperConfigToml {
    /// Remote destination as `host:port`.
    pub address: String,
    /// Dial timeout in milliseconds.
    pub dial_timeout_ms: u64,
    /// Tolerate an unreachable remote at startup.
    pub soft_start: bool,
    /// Reconnect interval in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Reserved staging buffer size.
    pub buffer_size: usize,
}

/// WAL configuration from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfigToml {
    /// Maximum segment size in bytes.
    pub max_segment_size: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log format (json, pretty).
    pub format: String,
}

impl Default for ShipperConfigToml {
    fn default() -> Self {
        Self {
            address: String::new(),
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT.as_millis() as u64,
            soft_start: false,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL.as_millis() as u64,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Default for WalConfigToml {
    fn default() -> Self {
        Self {
            max_segment_size: crate::wal::DEFAULT_SEGMENT_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            shipper: ShipperConfigToml::default(),
            wal: WalConfigToml::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or use defaults.
    pub async fn load() -> crate::Result<Self> {
        let mut config = if Path::new("config/default.toml").exists() {
            let content = fs::read_to_string("config/default.toml").await?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        if let Err(e) = config.validate_wal_config() {
            eprintln!("Invalid WAL configuration: {}", e);
            config.wal = WalConfigToml::default();
        }

        if let Err(e) = config.validate_logging_config() {
            eprintln!("Invalid logging configuration: {}", e);
            config.logging = LoggingConfig::default();
        }

        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("CRABSHIP_ADDRESS") {
            self.shipper.address = address;
            println!("Address from environment: {}", self.shipper.address);
        }

        if let Ok(data_dir) = std::env::var("CRABSHIP_DATA_DIR") {
            self.data_dir = data_dir;
            println!("Data directory from environment: {}", self.data_dir);
        }

        if let Ok(soft_start) = std::env::var("CRABSHIP_SOFT_START") {
            if let Ok(enabled) = soft_start.parse::<bool>() {
                self.shipper.soft_start = enabled;
                println!("Soft start from environment: {}", enabled);
            }
        }

        if let Ok(timeout) = std::env::var("CRABSHIP_DIAL_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.shipper.dial_timeout_ms = ms;
                println!("Dial timeout from environment: {}ms", ms);
            }
        }

        if let Ok(interval) = std::env::var("CRABSHIP_RECONNECT_INTERVAL_MS") {
            if let Ok(ms) = interval.parse::<u64>() {
                self.shipper.reconnect_interval_ms = ms;
                println!("Reconnect interval from environment: {}ms", ms);
            }
        }

        if let Ok(size) = std::env::var("CRABSHIP_BUFFER_SIZE") {
            if let Ok(buffer_size) = size.parse::<usize>() {
                self.shipper.buffer_size = buffer_size;
                println!("Buffer size from environment: {}", buffer_size);
            }
        }

        if let Ok(size) = std::env::var("CRABSHIP_WAL_MAX_SEGMENT_SIZE") {
            if let Ok(bytes) = size.parse::<u64>() {
                self.wal.max_segment_size = bytes;
                println!("WAL segment size from environment: {}", bytes);
            }
        }

        if let Ok(level) = std::env::var("CRABSHIP_LOG_LEVEL") {
            self.logging.level = level;
            println!("Log level from environment: {}", self.logging.level);
        }

        if let Ok(format) = std::env::var("CRABSHIP_LOG_FORMAT") {
            self.logging.format = format;
            println!("Log format from environment: {}", self.logging.format);
        }
    }

    /// Build the per-writer runtime options from this configuration.
    pub fn net_writer_config(&self) -> Result<NetWriterConfig, ConfigError> {
        let config = NetWriterConfig {
            address: self.shipper.address.clone(),
            dial_timeout: Duration::from_millis(self.shipper.dial_timeout_ms),
            soft_start: self.shipper.soft_start,
            reconnect_interval: Duration::from_millis(self.shipper.reconnect_interval_ms),
            buffer_size: self.shipper.buffer_size,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate_wal_config(&self) -> Result<(), String> {
        if self.wal.max_segment_size < 1024 * 1024 {
            return Err("WAL segment size must be at least 1MB".to_string());
        }
        Ok(())
    }

    fn validate_logging_config(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Valid levels: {:?}",
                self.logging.level, valid_levels
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(format!(
                "Invalid log format: {}. Valid formats: {:?}",
                self.logging.format, valid_formats
            ));
        }

        Ok(())
    }

    /// Save configuration to file.
    pub async fn save(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}
