//! Configuration for the gallery gateway.
//!
//! Values are layered: built-in defaults, then optional config files, then
//! environment variables prefixed with `GALLERY__`.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`Config::validate`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the gallery gateway
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Directory listing configuration
    #[serde(default)]
    pub listing: ListingConfig,
    /// Thumbnail extraction configuration
    #[serde(default)]
    pub thumbnail: ThumbnailConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty or json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port, 0 disables the exporter
    #[serde(default)]
    pub metrics_port: u16,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Directory listing and file streaming configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ListingConfig {
    /// Maximum number of children probed at the same time
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    /// Number of leading bytes read when sniffing a file's media type
    #[serde(default = "default_sniff_bytes")]
    pub sniff_bytes: usize,
    /// Read buffer size used when streaming raw files
    #[serde(default = "default_stream_chunk_bytes")]
    pub stream_chunk_bytes: usize,
}

/// Thumbnail extraction configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailConfig {
    /// Frame extraction program (resolved through PATH)
    #[serde(default = "default_program")]
    pub program: String,
    /// Maximum number of extraction processes running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Hard limit for one extraction, including the wait for a slot
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Start of the window a frame is selected from, in seconds
    #[serde(default = "default_window_start_secs")]
    pub window_start_secs: u32,
    /// End of the window a frame is selected from, in seconds
    #[serde(default = "default_window_end_secs")]
    pub window_end_secs: u32,
    /// Bytes buffered before the first byte is sent to the client
    #[serde(default = "default_first_flush_bytes")]
    pub first_flush_bytes: usize,
    /// Content type of the encoded frame
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

// Default value functions
fn default_service_name() -> String {
    "gallery-gateway".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    19992
}

fn default_probe_concurrency() -> usize {
    16
}

fn default_sniff_bytes() -> usize {
    8192
}

fn default_stream_chunk_bytes() -> usize {
    64 * 1024
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_window_start_secs() -> u32 {
    1
}

fn default_window_end_secs() -> u32 {
    10
}

fn default_first_flush_bytes() -> usize {
    16 * 1024
}

fn default_content_type() -> String {
    "image/jpeg".to_string()
}

impl Config {
    /// Load configuration from config files and environment
    ///
    /// `extra_file` is an explicit file given on the command line; unlike the
    /// well-known locations it must exist.
    pub fn load(extra_file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/gallery").required(false))
            .add_source(config::File::with_name("/etc/gallery/gallery").required(false));

        if let Some(path) = extra_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        // GALLERY__THUMBNAIL__MAX_CONCURRENT -> thumbnail.max_concurrent
        let config = builder
            .add_source(
                config::Environment::with_prefix("GALLERY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("listing.probe_concurrency", self.listing.probe_concurrency),
            ("listing.sniff_bytes", self.listing.sniff_bytes),
            ("listing.stream_chunk_bytes", self.listing.stream_chunk_bytes),
            ("thumbnail.max_concurrent", self.thumbnail.max_concurrent),
            ("thumbnail.first_flush_bytes", self.thumbnail.first_flush_bytes),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(invalid(key, "must be greater than 0"));
            }
        }

        if self.thumbnail.timeout_secs == 0 {
            return Err(invalid("thumbnail.timeout_secs", "must be greater than 0"));
        }

        if self.thumbnail.program.trim().is_empty() {
            return Err(invalid("thumbnail.program", "must not be empty"));
        }

        if self.thumbnail.window_start_secs >= self.thumbnail.window_end_secs {
            return Err(invalid(
                "thumbnail.window_start_secs",
                "must be lower than thumbnail.window_end_secs",
            ));
        }

        Ok(())
    }
}

impl ThumbnailConfig {
    /// Get the extraction timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: 0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            probe_concurrency: default_probe_concurrency(),
            sniff_bytes: default_sniff_bytes(),
            stream_chunk_bytes: default_stream_chunk_bytes(),
        }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
            window_start_secs: default_window_start_secs(),
            window_end_secs: default_window_end_secs(),
            first_flush_bytes: default_first_flush_bytes(),
            content_type: default_content_type(),
        }
    }
}
