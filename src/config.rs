// SPDX-License-Identifier: MIT

//! Configuration file loading.
//!
//! Every field has a default matching the fixed paths a grain sandbox uses,
//! so an absent file, section, or key falls back to those.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: HostConfig,
    pub agent: AgentConfig,
}

/// Where the host finds the sandbox launcher.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub libexecdir: PathBuf,
    /// File name of the launcher inside `libexecdir`.
    pub launcher: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            libexecdir: PathBuf::from("/usr/local/libexec/sandstorm"),
            launcher: "sandstorm-sandbox-launcher".to_string(),
        }
    }
}

impl HostConfig {
    pub fn launcher_path(&self) -> PathBuf {
        self.libexecdir.join(&self.launcher)
    }
}

/// Paths the sandbox agent uses inside the grain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub manifest_path: PathBuf,
    pub api_socket: PathBuf,
    /// The only supported first element of a continue command.
    pub bridge_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            manifest_path: PathBuf::from("/sandstorm-manifest"),
            api_socket: PathBuf::from("/tmp/sandstorm-api"),
            bridge_path: "/sandstorm-http-bridge".to_string(),
        }
    }
}

impl Config {
    pub fn parse(text: &str, origin: &Path) -> Result<Config, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.display().to_string(),
            source,
        })
    }

    /// Load `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Config::parse(&text, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("", Path::new("test.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(
            config.host.launcher_path(),
            PathBuf::from("/usr/local/libexec/sandstorm/sandstorm-sandbox-launcher")
        );
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            "[host]\nlibexecdir = \"/opt/libexec\"\n\n[agent]\napi_socket = \"/run/api\"\n",
            Path::new("test.toml"),
        )
        .unwrap();
        assert_eq!(
            config.host.launcher_path(),
            PathBuf::from("/opt/libexec/sandstorm-sandbox-launcher")
        );
        assert_eq!(config.agent.api_socket, PathBuf::from("/run/api"));
        assert_eq!(config.agent.bridge_path, "/sandstorm-http-bridge");
    }

    #[test]
    fn unknown_key_rejected() {
        let err = Config::parse("[host]\nlauncher_dir = \"/x\"\n", Path::new("bad.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grainbox.toml");
        std::fs::write(&path, "[agent]\nbridge_path = \"/bridge\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.agent.bridge_path, "/bridge");

        let missing = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
        assert_eq!(Config::load(None).unwrap(), Config::default());
    }
}
