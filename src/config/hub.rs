//! Hub configuration
//!
//! Loads server settings from an optional TOML file.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::hub::DEFAULT_OUTBOUND_CAPACITY;

/// Default configuration file name
pub const CONFIG_FILE: &str = "hub.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Path prefix in front of the identity segment
    pub path_prefix: String,
    /// Messages buffered per participant before it is dropped
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9000,
            path_prefix: "/ws".to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl HubConfig {
    /// Create a configuration for the given address with default settings
    #[cfg(test)]
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            ..Self::default()
        }
    }

    /// Load configuration from a file
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: HubConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Extract the identity from a request path such as `/ws/alice`
    ///
    /// The identity segment is percent-decoded. Returns `None` for a wrong
    /// prefix, an empty identity or a nested path.
    pub fn identity_from_path(&self, path: &str) -> Option<String> {
        let prefix = self.path_prefix.trim_end_matches('/');
        let segment = path.strip_prefix(prefix)?.strip_prefix('/')?;

        if segment.is_empty() || segment.contains('/') {
            return None;
        }

        let identity = urlencoding::decode(segment).ok()?;
        if identity.trim().is_empty() {
            return None;
        }

        Some(identity.into_owned())
    }
}
