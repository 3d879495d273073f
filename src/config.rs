//! Configuration file loading.
//!
//! The config lives at `$XDG_CONFIG_HOME/mpris-relay/config.toml`. When no
//! file exists at the default location, a commented example is written
//! there and used, so a fresh install starts with a working setup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::transform::RuleSetEntry;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/mpris.sock";

const DEFAULT_EXCLUDED: &[&str] = &["playerctld"];

const EXAMPLE_CONFIG: &str = r#"# mpris-relay configuration.

[global]
socket_path = "/tmp/mpris.sock"
# Plugin module namespaces to search before the built-ins.
plugin_paths = []
# Bus names containing any of these substrings are ignored.
excluded_players = ["playerctld"]

[drpc]
# Reserved for the rich-presence relay; parsed but currently unused.
enabled = false

# Rules run in order; each handler sees the output of the ones before it.
# The literal rule "always" matches every track.
[[rule]]
rule = "always"
handler = "artists.fix_artists()"
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
    #[error("cannot determine the user configuration directory")]
    NoConfigDir,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    global: GlobalSection,
    #[serde(default)]
    drpc: DrpcSection,
    #[serde(default, rename = "rule")]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize, Default)]
struct GlobalSection {
    socket_path: Option<PathBuf>,
    #[serde(default)]
    plugin_paths: Vec<String>,
    excluded_players: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct DrpcSection {
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    rule: String,
    handler: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    pub plugin_paths: Vec<String>,
    pub excluded_players: Vec<String>,
    pub ruleset: Vec<RuleSetEntry>,
    /// Reserved flag for the rich-presence relay.
    pub discord_rpc: bool,
}

impl Config {
    /// Load from an explicit path, or from the default location (creating
    /// the example config there on first run).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = Self::default_path()?;
                if !default.exists() {
                    materialize_example(&default)?;
                }
                default
            }
        };
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Self::parse(&text, &path)
    }

    fn default_path() -> Result<PathBuf, ConfigError> {
        let base = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(base.join("mpris-relay").join("config.toml"))
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Ok(Self {
            socket_path: raw
                .global
                .socket_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            plugin_paths: raw.global.plugin_paths,
            excluded_players: raw.global.excluded_players.unwrap_or_else(|| {
                DEFAULT_EXCLUDED.iter().map(|s| s.to_string()).collect()
            }),
            ruleset: raw
                .rules
                .into_iter()
                .map(|r| RuleSetEntry {
                    rule: r.rule,
                    handler: r.handler,
                })
                .collect(),
            discord_rpc: raw.drpc.enabled,
        })
    }
}

fn materialize_example(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, EXAMPLE_CONFIG).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
