//! Process configuration, loaded with explicit-file > env-var > default
//! precedence.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_daemon_registry_path() -> PathBuf {
    dirs_home().join(".opperator").join("daemons.json")
}

fn default_sqlite_path() -> PathBuf {
    dirs_home().join(".opperator").join("opperator.db")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_daemon_registry_path")]
    pub daemon_registry_path: PathBuf,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    #[serde(default = "Config::default_model")]
    pub default_model: String,

    /// Bounded follow-up pass count per turn.
    #[serde(default = "Config::default_max_follow_up_passes")]
    pub max_follow_up_passes: u32,

    #[serde(default)]
    pub permission_allow_list: Vec<String>,

    #[serde(default = "Config::default_log_level")]
    pub log_level: String,
}

impl Config {
    fn default_model() -> String {
        "claude-3-7-sonnet-20250219".to_string()
    }

    fn default_max_follow_up_passes() -> u32 {
        6
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Loads from `path` if given and present, then layers the
    /// `OPPERATOR_*` environment overrides, then falls back to defaults.
    pub fn load(path: Option<&std::path::Path>) -> crate::Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text).map_err(|e| crate::Error::ConfigError(e.to_string()))?
            }
            _ => Self::default(),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OPPERATOR_DAEMON_REGISTRY") {
            self.daemon_registry_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("OPPERATOR_SQLITE_PATH") {
            self.sqlite_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("OPPERATOR_DEFAULT_MODEL") {
            self.default_model = v;
        }
        if let Ok(v) = std::env::var("OPPERATOR_MAX_FOLLOW_UP_PASSES") {
            if let Ok(n) = v.parse() {
                self.max_follow_up_passes = n;
            }
        }
        if let Ok(v) = std::env::var("OPPERATOR_LOG_LEVEL") {
            self.log_level = v;
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon_registry_path: default_daemon_registry_path(),
            sqlite_path: default_sqlite_path(),
            default_model: Self::default_model(),
            max_follow_up_passes: Self::default_max_follow_up_passes(),
            permission_allow_list: Vec::new(),
            log_level: Self::default_log_level(),
        }
    }
}
