//! Server configuration.
//!
//! Loaded from a TOML file or built in code. Worker-loop count accepts an
//! integer or `"auto"`; byte thresholds accept size strings like `"64KB"`.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Configuration for one [`TcpServer`](crate::server::TcpServer).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server name, used to derive connection and thread names.
    #[serde(default = "default_name")]
    pub name: String,

    /// Address to listen on.
    pub address: SocketAddr,

    /// Number of worker loops: an integer or "auto" (one per CPU).
    /// 0 collapses to a single-reactor design on the accepting loop.
    #[serde(default)]
    pub worker_loops: WorkerLoops,

    /// Listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Set SO_REUSEADDR on the listening socket.
    #[serde(default = "default_true")]
    pub reuse_address: bool,

    /// Set SO_REUSEPORT on the listening socket.
    #[serde(default)]
    pub reuse_port: bool,

    /// Per-connection output-buffer threshold (e.g. "64KB", "4MB").
    #[serde(
        default = "default_high_water_mark",
        deserialize_with = "deserialize_size"
    )]
    pub high_water_mark: usize,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Configuration with defaults for everything but the address.
    pub fn for_address(address: SocketAddr) -> Self {
        Self {
            name: default_name(),
            address,
            worker_loops: WorkerLoops::default(),
            backlog: default_backlog(),
            reuse_address: true,
            reuse_port: false,
            high_water_mark: default_high_water_mark(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.backlog == 0 {
            return Err("backlog must be non-zero".into());
        }
        if self.high_water_mark == 0 {
            return Err("high_water_mark must be non-zero".into());
        }
        if self.name.is_empty() {
            return Err("name must be non-empty".into());
        }
        Ok(())
    }

    /// Resolved worker-loop count.
    pub fn worker_loops(&self) -> usize {
        match self.worker_loops {
            WorkerLoops::Count(n) => n,
            WorkerLoops::Auto => num_cpus::get(),
        }
    }
}

/// Worker-loop count: a fixed number or one per CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLoops {
    Count(usize),
    Auto,
}

impl Default for WorkerLoops {
    fn default() -> Self {
        WorkerLoops::Count(0)
    }
}

impl<'de> Deserialize<'de> for WorkerLoops {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Value {
            Number(usize),
            String(String),
        }

        match Value::deserialize(deserializer)? {
            Value::Number(n) => Ok(WorkerLoops::Count(n)),
            Value::String(s) => match s.to_lowercase().as_str() {
                "auto" => Ok(WorkerLoops::Auto),
                _ => Err(serde::de::Error::custom(format!(
                    "invalid worker_loops value: '{}' (expected a number or 'auto')",
                    s
                ))),
            },
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter (used when RUST_LOG is not set).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include thread names in log lines. Loop threads are named, so this
    /// is the cheapest way to see which reactor emitted a line.
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            thread_names: true,
        }
    }
}

// Default value functions

fn default_name() -> String {
    "kiln".to_string()
}

fn default_backlog() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

fn default_high_water_mark() -> usize {
    64 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Deserialize a size string like "64KB" or a plain byte count.
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "8KB", "64MB", "1GB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("8K").unwrap(), 8 * 1024);
        assert_eq!(parse_size("64KB").unwrap(), 64 * 1024);
        assert_eq!(parse_size("4MB").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_size("1GB").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("12XB").is_err());
    }

    #[test]
    fn test_minimal_toml() {
        let config: Config = toml::from_str(r#"address = "127.0.0.1:9000""#).unwrap();
        assert_eq!(config.name, "kiln");
        assert_eq!(config.worker_loops(), 0);
        assert_eq!(config.backlog, 4096);
        assert!(config.reuse_address);
        assert!(!config.reuse_port);
        assert_eq!(config.high_water_mark, 64 * 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_toml() {
        let config: Config = toml::from_str(
            r#"
            name = "echo"
            address = "0.0.0.0:7000"
            worker_loops = 4
            backlog = 128
            reuse_port = true
            high_water_mark = "64KB"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "echo");
        assert_eq!(config.worker_loops(), 4);
        assert_eq!(config.high_water_mark, 64 * 1024);
        assert_eq!(config.logging.format, LogFormat::Json);
        config.validate().unwrap();
    }

    #[test]
    fn test_auto_worker_loops() {
        let config: Config = toml::from_str(
            r#"
            address = "127.0.0.1:9000"
            worker_loops = "auto"
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_loops, WorkerLoops::Auto);
        assert!(config.worker_loops() >= 1);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            address = "127.0.0.1:9000"
            worker_threads = 4
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_backlog() {
        let mut config = Config::for_address("127.0.0.1:0".parse().unwrap());
        config.backlog = 0;
        assert!(config.validate().is_err());
    }
}
