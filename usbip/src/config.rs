//! Server configuration (§6 Configuration).
//!
//! The protocol core itself only *consumes* a [`ServerConfig`] value; loading
//! it from disk is ambient plumbing, kept here so `usbipd` and any other
//! embedder share one schema and one `toml` dependency.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 3240;
pub const DEFAULT_MAX_CONCURRENT_URBS: u32 = 64;
pub const DEFAULT_URB_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_concurrent_urbs")]
    pub max_concurrent_urbs: u32,

    #[serde(default = "default_urb_timeout_ms")]
    pub default_urb_timeout_ms: u64,

    /// When set, enumeration and import both filter against this list.
    #[serde(default)]
    pub allowed_bus_ids: Option<Vec<String>>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_concurrent_urbs() -> u32 {
    DEFAULT_MAX_CONCURRENT_URBS
}

fn default_urb_timeout_ms() -> u64 {
    DEFAULT_URB_TIMEOUT_MS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_concurrent_urbs: DEFAULT_MAX_CONCURRENT_URBS,
            default_urb_timeout_ms: DEFAULT_URB_TIMEOUT_MS,
            allowed_bus_ids: None,
        }
    }
}

impl ServerConfig {
    pub fn is_bus_id_allowed(&self, bus_id: &str) -> bool {
        match &self.allowed_bus_ids {
            Some(allowed) => allowed.iter().any(|b| b == bus_id),
            None => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

pub fn load_or_default(path: Option<&Path>) -> ServerConfig {
    match path {
        Some(path) => match load(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(%err, "failed to load config, falling back to defaults");
                ServerConfig::default()
            }
        },
        None => ServerConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3240);
        assert_eq!(config.max_concurrent_urbs, 64);
        assert_eq!(config.default_urb_timeout_ms, 5000);
        assert!(config.allowed_bus_ids.is_none());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: ServerConfig = toml::from_str("port = 4000\n").unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_concurrent_urbs, 64);
    }

    #[test]
    fn allow_list_filters_bus_ids() {
        let mut config = ServerConfig::default();
        assert!(config.is_bus_id_allowed("1-1"));

        config.allowed_bus_ids = Some(vec!["1-1".to_string()]);
        assert!(config.is_bus_id_allowed("1-1"));
        assert!(!config.is_bus_id_allowed("2-1"));
    }
}
