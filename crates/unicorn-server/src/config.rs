use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Per-project event buffer; slow sockets skip what falls off the end.
    pub broadcast_capacity: usize,
    pub allowed_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8800,
            db_path: PathBuf::from("./var/solo-unicorn.db"),
            broadcast_capacity: 256,
            allowed_origin: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
}

#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("solo-unicorn").join("server.toml"))
}

/// Loads `explicit` (which must exist) or the default location when present;
/// falls back to built-in defaults.
pub fn load(explicit: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(ServerConfig::default()),
        },
    };

    let raw = fs::read_to_string(&path)
        .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
}

impl ServerConfig {
    #[must_use]
    pub fn with_overrides(mut self, port: Option<u16>, db_path: Option<PathBuf>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(db_path) = db_path {
            self.db_path = db_path;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: ServerConfig = toml::from_str("port = 9100\n").unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.db_path, PathBuf::from("./var/solo-unicorn.db"));
    }

    #[test]
    fn cli_overrides_win() {
        let config = ServerConfig::default().with_overrides(Some(1), Some(PathBuf::from("x.db")));
        assert_eq!(config.port, 1);
        assert_eq!(config.db_path, PathBuf::from("x.db"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = load(Some(Path::new("/definitely/not/here/server.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
