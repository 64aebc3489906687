//! Configuration loading.
//!
//! Settings come from a JSON file (the platform config directory, or an
//! explicit path) with environment variable overrides on top. The access
//! token is only ever taken from the environment and never written back.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::constants;
use crate::janus::SessionSettings;
use crate::media::{IceServer, MediaConfig};
use crate::watch::StreamDocuments;

/// Configuration for the streamwatch CLI.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Phoenix socket endpoint of the API.
    pub api_url: String,
    /// Janus gateway base URL.
    pub signaling_url: String,
    /// Janus plugin to attach.
    pub plugin: String,
    /// Timeout in seconds for non-poll signaling requests.
    pub request_timeout: u64,
    /// Interval in seconds between metadata refreshes.
    pub metadata_refresh: u64,
    /// STUN/TURN servers.
    pub ice_servers: Vec<IceServer>,
    /// GraphQL documents for metadata, history and chat.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<StreamDocuments>,
    /// API token - NOT serialized to disk (env only).
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "ws://localhost:4000/api/socket/websocket".to_string(),
            signaling_url: "http://localhost:8088/janus".to_string(),
            plugin: constants::DEFAULT_PLUGIN.to_string(),
            request_timeout: constants::HTTP_REQUEST_TIMEOUT.as_secs(),
            metadata_refresh: constants::METADATA_REFRESH_INTERVAL.as_secs(),
            ice_servers: Vec::new(),
            documents: None,
            token: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// `STREAMWATCH_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("STREAMWATCH_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("streamwatch"))
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// An explicit `path` must exist. Without one, `config.json` in
    /// [`Config::config_dir`] is used when present and defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => {
                let default_path = Self::config_dir()?.join("config.json");
                if default_path.exists() {
                    Self::load_from(&default_path)?
                } else {
                    log::debug!("No config at {}, using defaults", default_path.display());
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from `path` without overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Writes the configuration to `path` as pretty JSON (token excluded).
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(api_url) = var("STREAMWATCH_API_URL") {
            self.api_url = api_url;
        }

        if let Some(signaling_url) = var("STREAMWATCH_SIGNALING_URL") {
            self.signaling_url = signaling_url;
        }

        if let Some(plugin) = var("STREAMWATCH_PLUGIN") {
            self.plugin = plugin;
        }

        // Token from env var only
        if let Some(token) = var("STREAMWATCH_TOKEN").filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }

        if let Some(timeout) = var("STREAMWATCH_REQUEST_TIMEOUT") {
            match timeout.parse::<u64>() {
                Ok(secs) => self.request_timeout = secs,
                Err(_) => log::warn!("Ignoring invalid STREAMWATCH_REQUEST_TIMEOUT={timeout}"),
            }
        }

        if let Some(refresh) = var("STREAMWATCH_METADATA_REFRESH") {
            match refresh.parse::<u64>() {
                Ok(secs) => self.metadata_refresh = secs,
                Err(_) => log::warn!("Ignoring invalid STREAMWATCH_METADATA_REFRESH={refresh}"),
            }
        }
    }

    /// Non-poll signaling request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    /// Metadata refresh period.
    #[must_use]
    pub fn metadata_refresh(&self) -> Duration {
        Duration::from_secs(self.metadata_refresh.max(1))
    }

    /// Negotiation session settings.
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            plugin: self.plugin.clone(),
            ..SessionSettings::default()
        }
    }

    /// Peer connection policy with the configured ICE servers.
    #[must_use]
    pub fn media_config(&self) -> MediaConfig {
        MediaConfig {
            ice_servers: self.ice_servers.clone(),
            ..MediaConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.plugin, "janus.plugin.ftl");
        assert_eq!(config.request_timeout, 10);
        assert_eq!(config.metadata_refresh, 30);
        assert!(config.token.is_none());
    }

    #[test]
    fn test_config_serialization_excludes_token() {
        let config = Config {
            token: Some("secret_token".to_string()),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();

        assert!(!json.contains("secret_token"));
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"signaling_url": "https://gw.example/janus"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.signaling_url, "https://gw.example/janus");
        assert_eq!(config.plugin, "janus.plugin.ftl");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let config = Config {
            metadata_refresh: 5,
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.example.org:3478".into()],
                username: None,
                credential: None,
            }],
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(vars(&[
            ("STREAMWATCH_API_URL", "wss://api.example/socket/websocket"),
            ("STREAMWATCH_PLUGIN", "janus.plugin.streaming"),
            ("STREAMWATCH_TOKEN", "tok"),
            ("STREAMWATCH_REQUEST_TIMEOUT", "3"),
            ("STREAMWATCH_METADATA_REFRESH", "not-a-number"),
        ]));
        assert_eq!(config.api_url, "wss://api.example/socket/websocket");
        assert_eq!(config.plugin, "janus.plugin.streaming");
        assert_eq!(config.token.as_deref(), Some("tok"));
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.metadata_refresh, 30);
    }

    #[test]
    fn test_empty_token_ignored() {
        let mut config = Config::default();
        config.apply_overrides(vars(&[("STREAMWATCH_TOKEN", "")]));
        assert!(config.token.is_none());
    }

    #[test]
    fn test_derived_settings() {
        let config = Config {
            plugin: "custom".into(),
            ..Config::default()
        };
        assert_eq!(config.session_settings().plugin, "custom");
        assert!(!config.media_config().tcp_candidates);
    }
}
