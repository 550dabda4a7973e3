//! Layered configuration: built-in defaults, overridden by an optional TOML
//! file, overridden in turn by environment variables. Loaded once in the
//! composition root and handed around as `Arc<Config>`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub auth_token: Option<String>,
    pub repos_base_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub secrets_dir: PathBuf,
    pub data_dir: PathBuf,
    pub github_token: Option<String>,
    pub gitlab_token: Option<String>,
    pub event_heartbeat_secs: u64,
    pub agent_timeout_secs: u64,
    pub agent_timeout_extend_secs: u64,
    pub event_log_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            host: "127.0.0.1".into(),
            port: 4173,
            auth_token: None,
            repos_base_dir: home.join(".orchestrator").join("repos"),
            worktrees_dir: home.join(".orchestrator").join("worktrees"),
            secrets_dir: home.join(".orchestrator").join("secrets"),
            data_dir: home.join(".orchestrator"),
            github_token: None,
            gitlab_token: None,
            event_heartbeat_secs: 15,
            agent_timeout_secs: 300,
            agent_timeout_extend_secs: 300,
            event_log_buffer_size: 2000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

impl Config {
    /// Load defaults, layer the TOML config file on top if present, then
    /// layer environment variables on top of that.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let toml_path = Self::default_toml_path();
        if toml_path.exists() {
            cfg = cfg.merge_toml_file(&toml_path)?;
        }
        cfg.apply_env();
        Ok(cfg)
    }

    fn merge_toml_file(self, path: &PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let file_cfg: PartialConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(file_cfg.apply_onto(self))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
        if let Ok(v) = std::env::var("AUTH_TOKEN") {
            self.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("REPOS_BASE_DIR") {
            self.repos_base_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("WORKTREES_DIR") {
            self.worktrees_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SECRETS_DIR") {
            self.secrets_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GITHUB_TOKEN") {
            self.github_token = Some(v);
        }
        if let Ok(v) = std::env::var("GITLAB_TOKEN") {
            self.gitlab_token = Some(v);
        }
        if let Ok(v) = std::env::var("EVENT_HEARTBEAT_SECS") {
            if let Ok(n) = v.parse() {
                self.event_heartbeat_secs = n;
            }
        }
        if let Ok(v) = std::env::var("AGENT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.agent_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("AGENT_TIMEOUT_EXTEND_SECS") {
            if let Ok(n) = v.parse() {
                self.agent_timeout_extend_secs = n;
            }
        }
        if let Ok(v) = std::env::var("EVENT_LOG_BUFFER_SIZE") {
            if let Ok(n) = v.parse() {
                self.event_log_buffer_size = n;
            }
        }
    }

    fn default_toml_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("orchestrator")
            .join("config.toml")
    }

    pub fn tasks_db_path(&self) -> PathBuf {
        self.data_dir.join("tasks.db")
    }
}

/// Mirrors [`Config`] but with every field optional, so a TOML file only
/// needs to specify the keys it wants to override.
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    host: Option<String>,
    port: Option<u16>,
    auth_token: Option<String>,
    repos_base_dir: Option<PathBuf>,
    worktrees_dir: Option<PathBuf>,
    secrets_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    github_token: Option<String>,
    gitlab_token: Option<String>,
    event_heartbeat_secs: Option<u64>,
    agent_timeout_secs: Option<u64>,
    agent_timeout_extend_secs: Option<u64>,
    event_log_buffer_size: Option<usize>,
}

impl PartialConfig {
    fn apply_onto(self, mut base: Config) -> Config {
        if let Some(v) = self.host {
            base.host = v;
        }
        if let Some(v) = self.port {
            base.port = v;
        }
        if self.auth_token.is_some() {
            base.auth_token = self.auth_token;
        }
        if let Some(v) = self.repos_base_dir {
            base.repos_base_dir = v;
        }
        if let Some(v) = self.worktrees_dir {
            base.worktrees_dir = v;
        }
        if let Some(v) = self.secrets_dir {
            base.secrets_dir = v;
        }
        if let Some(v) = self.data_dir {
            base.data_dir = v;
        }
        if self.github_token.is_some() {
            base.github_token = self.github_token;
        }
        if self.gitlab_token.is_some() {
            base.gitlab_token = self.gitlab_token;
        }
        if let Some(v) = self.event_heartbeat_secs {
            base.event_heartbeat_secs = v;
        }
        if let Some(v) = self.agent_timeout_secs {
            base.agent_timeout_secs = v;
        }
        if let Some(v) = self.agent_timeout_extend_secs {
            base.agent_timeout_extend_secs = v;
        }
        if let Some(v) = self.event_log_buffer_size {
            base.event_log_buffer_size = v;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 4173);
        assert_eq!(cfg.event_log_buffer_size, 2000);
    }

    #[test]
    fn partial_toml_only_overrides_given_keys() {
        let base = Config::default();
        let partial: PartialConfig = toml::from_str("port = 9999\n").unwrap();
        let merged = partial.apply_onto(base.clone());
        assert_eq!(merged.port, 9999);
        assert_eq!(merged.host, base.host);
    }
}
