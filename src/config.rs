//! Agent configuration types.
//!
//! JSON is the config source. Loading the bytes from disk and persisting a
//! generated client ID are a collaborator's job; this module owns the shape
//! and the raw-then-validated two-step parse, the same shape
//! `forwarder::config` uses for its TOML source.

use serde::Deserialize;
use thiserror::Error;

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub client_id: String,
    pub secret: String,
    pub log_level: String,
    pub printers: Vec<PrinterConfig>,
}

#[derive(Debug, Clone)]
pub struct PrinterConfig {
    pub unique_id: String,
    pub port: String,
    pub baud_rate: u32,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    server_host: Option<String>,
    client_id: Option<String>,
    secret: Option<String>,
    log_level: Option<String>,
    printers: Option<Vec<RawPrinterConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawPrinterConfig {
    unique_id: Option<String>,
    port: Option<String>,
    baud_rate: Option<u32>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed config JSON: {0}")]
    Parse(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl Config {
    /// Parse and validate a config document already loaded into memory.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::validate(raw)
    }

    /// Parse and validate a config document from its raw JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let server_host = raw.server_host.ok_or(ConfigError::MissingField("server_host"))?;
        let client_id = raw.client_id.ok_or(ConfigError::MissingField("client_id"))?;
        let secret = raw.secret.ok_or(ConfigError::MissingField("secret"))?;
        let log_level = raw.log_level.unwrap_or_else(|| "info".to_owned());

        let raw_printers = raw.printers.unwrap_or_default();
        let mut printers = Vec::with_capacity(raw_printers.len());
        for (i, p) in raw_printers.into_iter().enumerate() {
            let unique_id = p.unique_id.ok_or_else(|| ConfigError::InvalidValue {
                field: "printers[].unique_id",
                reason: format!("entry {i} is missing unique_id"),
            })?;
            let port = p.port.ok_or_else(|| ConfigError::InvalidValue {
                field: "printers[].port",
                reason: format!("entry {i} is missing port"),
            })?;
            printers.push(PrinterConfig {
                unique_id,
                port,
                baud_rate: p.baud_rate.unwrap_or(115_200),
            });
        }

        Ok(Config { server_host, client_id, secret, log_level, printers })
    }
}
