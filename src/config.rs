use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::query::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub query: QueryConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Backend root, e.g. https://tasks.example.com/api
  pub base_url: String,
  /// Per-request timeout
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueryConfig {
  /// How long fetched data stays fresh
  pub stale_time_secs: u64,
  /// Additional attempts after a failed fetch
  pub retries: u32,
  pub retry_delay_ms: u64,
  pub max_retry_delay_ms: u64,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 300,
      retries: 2,
      retry_delay_ms: 1000,
      max_retry_delay_ms: 30_000,
    }
  }
}

impl QueryConfig {
  pub fn stale_time(&self) -> Duration {
    Duration::from_secs(self.stale_time_secs)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      retries: self.retries,
      base_delay: Duration::from_millis(self.retry_delay_ms),
      max_delay: Duration::from_millis(self.max_retry_delay_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  /// Keep fetched data between runs
  pub persist: bool,
  /// Snapshot database (default: $XDG_DATA_HOME/taskdeck/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      persist: true,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter directive when TASKDECK_LOG is unset (e.g. "debug")
  pub level: Option<String>,
  /// Log directory (default: $XDG_DATA_HOME/taskdeck/logs)
  pub dir: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./taskdeck.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/taskdeck/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/taskdeck/config.yaml\n\
                 with at least:\n\n  api:\n    base_url: https://tasks.example.com/api"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("taskdeck.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("taskdeck").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url '{}': {}", config.api.base_url, e))?;
    Ok(config)
  }

  /// Get the API token from the environment.
  ///
  /// Checks TASKDECK_API_TOKEN. Unauthenticated backends need none.
  pub fn get_api_token() -> Option<String> {
    std::env::var("TASKDECK_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  base_url: http://localhost:8080/api\n").unwrap();
    assert_eq!(config.api.timeout(), Duration::from_secs(30));
    assert_eq!(config.query, QueryConfig::default());
    assert_eq!(config.query.stale_time(), Duration::from_secs(300));
    assert_eq!(config.query.retry_policy(), RetryPolicy::default());
    assert!(config.cache.persist);
    assert_eq!(config.log, LogConfig::default());
  }

  #[test]
  fn test_overrides() {
    let yaml = r#"
api:
  base_url: https://tasks.example.com
  timeout_secs: 5
query:
  stale_time_secs: 60
  retries: 0
cache:
  persist: false
log:
  level: debug
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.api.timeout_secs, 5);
    assert_eq!(config.query.stale_time_secs, 60);
    assert_eq!(config.query.retry_policy().retries, 0);
    assert_eq!(config.query.retry_delay_ms, 1000);
    assert!(!config.cache.persist);
    assert_eq!(config.log.level.as_deref(), Some("debug"));
  }

  #[test]
  fn test_invalid_base_url_rejected() {
    assert!(Config::parse("api:\n  base_url: not a url\n").is_err());
  }
}
