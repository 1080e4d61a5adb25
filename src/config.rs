//! Configuration module for linkwatch.
//!
//! Options come from the command line, falling back to `LINKWATCH_*`
//! environment variables and then to defaults. The result is validated
//! once into an immutable [`MonitorConfig`].

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;
use thiserror::Error;

use crate::probe::CheckMethod;

/// Configuration error types. Always fatal at startup.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be a positive number of seconds, got {value}")]
    NonPositive { field: &'static str, value: f64 },
    #[error("ping count must be at least 1")]
    ZeroPingCount,
    #[error("socket port must be non-zero")]
    ZeroPort,
    #[error("host must not be empty")]
    EmptyHost,
    #[error("invalid HTTP URL {0:?}: {1}")]
    InvalidHttpUrl(String, String),
}

/// Output format of the report document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "linkwatch")]
#[command(about = "Monitor connection stability with ping, TCP, HTTP and UDP probes")]
#[command(version)]
pub struct Cli {
    /// Host to check (IP address or hostname)
    #[arg(long, env = "LINKWATCH_HOST", default_value = "8.8.8.8")]
    pub host: String,

    /// Seconds between tick starts
    #[arg(short, long, env = "LINKWATCH_INTERVAL", default_value_t = 1.0)]
    pub interval: f64,

    /// Echo requests per ping probe
    #[arg(long, env = "LINKWATCH_PING_COUNT", default_value_t = 3)]
    pub ping_count: u32,

    /// Per-probe timeout in seconds
    #[arg(short, long, env = "LINKWATCH_TIMEOUT", default_value_t = 1.0)]
    pub timeout: f64,

    /// Which probes decide connectivity
    #[arg(short = 'm', long, env = "LINKWATCH_CHECK_METHOD", value_enum, default_value = "all")]
    pub check_method: CheckMethod,

    /// URL fetched by the HTTP probe
    #[arg(long, env = "LINKWATCH_HTTP_URL", default_value = "https://www.google.com/")]
    pub http_url: String,

    /// TCP port used by the socket probe
    #[arg(long, env = "LINKWATCH_SOCKET_PORT", default_value_t = 53)]
    pub socket_port: u16,

    /// CSV log of samples
    #[arg(long, env = "LINKWATCH_LOG_FILE", default_value = "connection_log.csv")]
    pub log_file: PathBuf,

    /// Report document written on exit
    #[arg(long, env = "LINKWATCH_REPORT_FILE", default_value = "connection_report.txt")]
    pub report_file: PathBuf,

    /// Report document format
    #[arg(long, env = "LINKWATCH_REPORT_FORMAT", value_enum, default_value = "text")]
    pub report_format: ReportFormat,

    /// Stop after this many seconds (runs until interrupted if omitted)
    #[arg(short, long, env = "LINKWATCH_DURATION")]
    pub duration: Option<f64>,

    /// Only regenerate the report from an existing log
    #[arg(long)]
    pub only_report: bool,
}

/// Validated monitor settings, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub host: String,
    pub interval: Duration,
    pub ping_count: u32,
    pub timeout: Duration,
    pub check_method: CheckMethod,
    pub http_url: String,
    pub socket_port: u16,
    pub log_file: PathBuf,
    pub report_file: PathBuf,
    pub report_format: ReportFormat,
    pub duration: Option<Duration>,
    pub only_report: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            host: "8.8.8.8".to_string(),
            interval: Duration::from_secs(1),
            ping_count: 3,
            timeout: Duration::from_secs(1),
            check_method: CheckMethod::All,
            http_url: "https://www.google.com/".to_string(),
            socket_port: 53,
            log_file: PathBuf::from("connection_log.csv"),
            report_file: PathBuf::from("connection_report.txt"),
            report_format: ReportFormat::Text,
            duration: None,
            only_report: false,
        }
    }
}

impl Cli {
    /// Validate the raw options into a [`MonitorConfig`].
    pub fn into_config(self) -> Result<MonitorConfig, ConfigError> {
        let host = self.host.trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.ping_count == 0 {
            return Err(ConfigError::ZeroPingCount);
        }
        if self.socket_port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        validate_http_url(&self.http_url)?;

        Ok(MonitorConfig {
            host,
            interval: positive_seconds("interval", self.interval)?,
            ping_count: self.ping_count,
            timeout: positive_seconds("timeout", self.timeout)?,
            check_method: self.check_method,
            http_url: self.http_url,
            socket_port: self.socket_port,
            log_file: self.log_file,
            report_file: self.report_file,
            report_format: self.report_format,
            duration: self
                .duration
                .map(|d| positive_seconds("duration", d))
                .transpose()?,
            only_report: self.only_report,
        })
    }
}

fn positive_seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::NonPositive { field, value });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::NonPositive { field, value })
}

fn validate_http_url(raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidHttpUrl(raw.to_string(), e.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(()),
        "http" | "https" => Err(ConfigError::InvalidHttpUrl(raw.to_string(), "missing host".to_string())),
        other => Err(ConfigError::InvalidHttpUrl(
            raw.to_string(),
            format!("unsupported scheme {}", other),
        )),
    }
}
