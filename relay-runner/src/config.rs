//! Configuration for the runner daemon.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Main configuration structure loaded from the TOML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Coordinator connection settings
    pub runner: RunnerConfig,
    /// GitHub connections keyed by a local name
    #[serde(default)]
    pub github: HashMap<String, GithubInfo>,
}

/// Coordinator connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Coordinator endpoint URL (e.g., "https://relay.example.com:7443")
    pub url: String,
    /// Runner API token ("rlyr_...")
    pub token: String,
    /// Skip TLS certificate verification (local development only)
    #[serde(default)]
    pub skip_tls_verify: bool,
    /// Container runtime used for agent invocations
    #[serde(default = "default_runtime")]
    pub runtime: String,
}

fn default_runtime() -> String {
    "podman".to_string()
}

/// A named GitHub connection usable by proxy handlers and invocations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GithubInfo {
    /// Base URL; anything other than github.com is treated as Enterprise
    #[serde(default = "default_github_url")]
    pub url: String,
    /// Connection id referenced by inbound messages
    pub connection_id: String,
    /// Access token for this connection
    pub token: String,
}

fn default_github_url() -> String {
    "https://github.com".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut errors = Vec::new();
        if config.runner.url.is_empty() {
            errors.push("runner.url: Coordinator endpoint URL");
        }
        if config.runner.token.is_empty() {
            errors.push("runner.token: Runner API token (rlyr_...)");
        }
        for (name, github) in &config.github {
            if github.connection_id.is_empty() || github.token.is_empty() {
                errors.push(if name.is_empty() {
                    "github.*: connection_id and token are required"
                } else {
                    "github.<name>: connection_id and token are required"
                });
                break;
            }
        }

        if !errors.is_empty() {
            let message = format!(
                "Configuration incomplete\n\nPlease edit {} and set:\n  - {}",
                path.display(),
                errors.join("\n  - ")
            );
            return Err(Error::Config(message));
        }

        Ok(config)
    }

    /// Index GitHub connections by the connection id messages reference.
    pub fn connection_index(&self) -> HashMap<String, GithubInfo> {
        self.github
            .values()
            .map(|info| (info.connection_id.clone(), info.clone()))
            .collect()
    }

    /// Get the default configuration file path.
    ///
    /// - macOS: `~/Library/Application Support/relay-runner/config.toml`
    /// - Linux: `~/.config/relay-runner/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relay-runner")
            .join("config.toml")
    }

    /// Get the default data directory (logs, job output).
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relay-runner")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[runner]
url = "https://relay.example.com:7443"
token = "rlyr_abc"
"#;
        let config: Config = toml::from_str(toml).expect("Failed to parse config");
        assert_eq!(config.runner.url, "https://relay.example.com:7443");
        assert_eq!(config.runner.runtime, "podman");
        assert!(!config.runner.skip_tls_verify);
        assert!(config.github.is_empty());
    }

    #[test]
    fn test_parse_github_connections() {
        let toml = r#"
[runner]
url = "https://relay.example.com:7443"
token = "rlyr_abc"
runtime = "podman"

[github.work]
url = "https://github.example.com"
connection_id = "cnn-1"
token = "ghp_xyz"
"#;
        let config: Config = toml::from_str(toml).expect("Failed to parse config");
        let index = config.connection_index();
        let info = index.get("cnn-1").expect("connection indexed by id");
        assert_eq!(info.url, "https://github.example.com");
        assert_eq!(info.token, "ghp_xyz");
    }

    #[test]
    fn test_default_github_url() {
        let toml = r#"
[runner]
url = "https://relay.example.com:7443"
token = "rlyr_abc"

[github.personal]
connection_id = "cnn-2"
token = "ghp_abc"
"#;
        let config: Config = toml::from_str(toml).expect("Failed to parse config");
        assert_eq!(config.github["personal"].url, "https://github.com");
    }
}
