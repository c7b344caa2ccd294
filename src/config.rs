use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub tasks: TasksConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
  /// Base URL of the REST data service
  pub url: String,
  /// Owner of every record this device creates
  pub user_id: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
  pub namespace: String,
  pub quota_bytes: u64,
  /// TTL for cached copies of remote records. 0 keeps them until evicted.
  pub remote_ttl_secs: u64,
  /// Override for the SQLite file (default: data dir)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectivityConfig {
  /// Defaults to `remote.url`
  pub probe_url: Option<String>,
  pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TasksConfig {
  /// 0 disables the periodic location update
  pub location_update_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
  /// Default filter directive, overridden by RUST_LOG
  pub level: String,
  /// Log file directory (default: data dir)
  pub directory: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
  30
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      namespace: "tripsync".to_string(),
      quota_bytes: 50 * 1024 * 1024,
      remote_ttl_secs: 7 * 24 * 60 * 60,
      path: None,
    }
  }
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      poll_interval_secs: 15,
    }
  }
}

impl Default for TasksConfig {
  fn default() -> Self {
    Self {
      location_update_interval_secs: 900,
    }
  }
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl RemoteConfig {
  /// Base URL with a trailing slash, so collection paths join under it.
  pub fn base_url(&self) -> Result<Url> {
    let mut raw = self.url.trim().to_string();
    if !raw.ends_with('/') {
      raw.push('/');
    }
    Url::parse(&raw).map_err(|e| eyre!("Invalid remote url {}: {}", self.url, e))
  }
}

impl CacheConfig {
  pub fn remote_ttl(&self) -> Option<chrono::Duration> {
    match self.remote_ttl_secs {
      0 => None,
      secs => i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds),
    }
  }
}

impl ConnectivityConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }
}

impl TasksConfig {
  pub fn location_update_interval(&self) -> Option<Duration> {
    match self.location_update_interval_secs {
      0 => None,
      secs => Some(Duration::from_secs(secs)),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tripsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tripsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/tripsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tripsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tripsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.remote.base_url()?;
    if config.cache.quota_bytes == 0 {
      return Err(eyre!("cache.quota_bytes must be greater than zero"));
    }
    Ok(config)
  }

  /// URL probed for connectivity.
  pub fn probe_url(&self) -> Result<Url> {
    match &self.connectivity.probe_url {
      Some(url) => Url::parse(url).map_err(|e| eyre!("Invalid probe url {}: {}", url, e)),
      None => self.remote.base_url(),
    }
  }

  /// Get the remote API key from the environment.
  ///
  /// Checks TRIPSYNC_API_KEY. Anonymous access is allowed when unset.
  pub fn get_api_key() -> Option<String> {
    std::env::var("TRIPSYNC_API_KEY")
      .ok()
      .filter(|key| !key.is_empty())
  }
}
