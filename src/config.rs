use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Cache version string. Doubles as the bucket name and as the marker the
  /// activation sweep uses to identify stale buckets. Any change to the
  /// assets served by `upstream` must be paired with a change here, or
  /// existing caches keep serving the old content indefinitely.
  pub version: String,
  /// Origin server the proxy sits in front of (absolute http/https URL).
  pub upstream: Url,
  /// Address the proxy listens on.
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  /// Offline fallback document for navigation requests.
  #[serde(default = "default_shell")]
  pub shell: String,
  /// URLs to pre-cache on startup: paths resolved against `upstream`, or
  /// absolute CDN URLs used as-is.
  #[serde(default)]
  pub precache: Vec<String>,
  /// Path prefixes that go straight to the network and are never cached
  /// (e.g. "/api/").
  #[serde(default)]
  pub bypass: Vec<String>,
  /// Override for the cache database location.
  pub cache_dir: Option<PathBuf>,
  /// Write logs to this file instead of stderr.
  pub log_file: Option<PathBuf>,
}

fn default_listen() -> SocketAddr {
  ([127, 0, 0, 1], 8790).into()
}

fn default_shell() -> String {
  "./index.html".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./silo.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/silo/config.yaml
  /// 4. ~/.config/silo/config.yaml
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
        "No configuration file found. Create one at ~/.config/silo/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("silo.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("silo").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    config.validate()?;

    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("Config field 'version' must not be empty"));
    }
    match self.upstream.scheme() {
      "http" | "https" => {}
      other => {
        return Err(eyre!(
          "Config field 'upstream' must be an http(s) URL, got scheme '{}'",
          other
        ))
      }
    }
    Ok(())
  }

  /// Resolve the cache database path.
  ///
  /// Uses `cache_dir` if configured, otherwise $XDG_DATA_HOME/silo.
  pub fn cache_db_path(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.cache_dir {
      return Ok(dir.join("cache.db"));
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("silo").join("cache.db"))
  }
}
