//! Project configuration (`kiln.toml`).
//!
//! Every section is optional; a project without a config file builds with
//! defaults. A handful of settings can be overridden from the environment
//! so CI can tune a build without editing the checked-in file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

use crate::consts::{CONFIG_FILE_NAME, DEFAULT_BUILD_FILE_NAME, DEFAULT_TEST_FILTER_FLAG, DEFAULT_TEST_LIST_FLAG};

/// Overrides `[build] threads`.
pub const ENV_THREADS: &str = "KILN_THREADS";
/// Overrides `[cache] dir`.
pub const ENV_CACHE_DIR: &str = "KILN_CACHE_DIR";
/// Overrides `[cache] mode`.
pub const ENV_CACHE_MODE: &str = "KILN_CACHE_MODE";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: Box<toml::de::Error>,
  },

  #[error("invalid value {value:?} for environment variable {var}: {message}")]
  Env {
    var: &'static str,
    value: String,
    message: String,
  },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
  pub build: BuildSection,
  pub project: ProjectSection,
  pub cache: CacheSection,
  pub test: TestSection,
  /// Tool name to executable path.
  pub tools: BTreeMap<String, PathBuf>,
  /// Cell name to directory, relative to the project root.
  pub cells: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSection {
  /// Maximum number of rules executing at once.
  pub threads: usize,
  /// Keep building rules unrelated to a failure.
  pub keep_going: bool,
}

impl Default for BuildSection {
  fn default() -> Self {
    Self {
      threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
      keep_going: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectSection {
  pub build_file_name: String,
  /// Project-relative directories never treated as packages.
  pub ignore: Vec<PathBuf>,
  pub enforce_package_boundary: bool,
}

impl Default for ProjectSection {
  fn default() -> Self {
    Self {
      build_file_name: DEFAULT_BUILD_FILE_NAME.to_string(),
      ignore: Vec::new(),
      enforce_package_boundary: true,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
  #[default]
  Dir,
  Memory,
  None,
}

impl std::str::FromStr for CacheMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "dir" => Ok(CacheMode::Dir),
      "memory" => Ok(CacheMode::Memory),
      "none" => Ok(CacheMode::None),
      other => Err(format!("expected one of dir, memory, none; got {other}")),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
  pub mode: CacheMode,
  /// Cache directory; relative paths resolve against the project root.
  pub dir: Option<PathBuf>,
  /// Place the cache in the per-user cache directory instead of the project.
  pub shared: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestSection {
  /// Minimum spacing between launches of throttled test tools.
  #[serde(deserialize_with = "deserialize_duration")]
  pub stutter_timeout: Option<Duration>,
  pub list_flag: String,
  pub filter_flag: String,
  /// Prefix applied to every per-test environment variable name.
  pub env_prefix: Option<String>,
}

impl Default for TestSection {
  fn default() -> Self {
    Self {
      stutter_timeout: None,
      list_flag: DEFAULT_TEST_LIST_FLAG.to_string(),
      filter_flag: DEFAULT_TEST_FILTER_FLAG.to_string(),
      env_prefix: None,
    }
  }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
  D: Deserializer<'de>,
{
  let raw: Option<String> = Option::deserialize(deserializer)?;
  raw
    .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
    .transpose()
}

impl KilnConfig {
  /// Parse configuration text. Environment overrides are not applied.
  pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
    toml::from_str(text).map_err(|e| ConfigError::Parse {
      path: path.to_path_buf(),
      source: Box::new(e),
    })
  }

  /// Load `kiln.toml` from the project root, then apply environment overrides.
  pub fn load(project_root: &Path) -> Result<Self, ConfigError> {
    let path = project_root.join(CONFIG_FILE_NAME);
    let mut config = match std::fs::read_to_string(&path) {
      Ok(text) => Self::parse(&text, &path)?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = ?path, "no config file, using defaults");
        Self::default()
      }
      Err(source) => return Err(ConfigError::Read { path, source }),
    };
    config.apply_env_overrides()?;
    Ok(config)
  }

  fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(ENV_THREADS) {
      self.build.threads = match value.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
          return Err(ConfigError::Env {
            var: ENV_THREADS,
            value,
            message: "expected a positive integer".to_string(),
          });
        }
      };
    }
    if let Ok(value) = std::env::var(ENV_CACHE_MODE) {
      self.cache.mode = value.parse().map_err(|message| ConfigError::Env {
        var: ENV_CACHE_MODE,
        value: value.clone(),
        message,
      })?;
    }
    if let Some(dir) = std::env::var_os(ENV_CACHE_DIR) {
      self.cache.dir = Some(PathBuf::from(dir));
    }
    Ok(())
  }

  /// Effective cache directory for `CacheMode::Dir`.
  pub fn cache_dir(&self, project_root: &Path) -> PathBuf {
    if let Some(dir) = &self.cache.dir {
      return project_root.join(dir);
    }
    if self.cache.shared
      && let Some(dir) = crate::platform::paths::user_cache_dir()
    {
      return dir.join("artifacts");
    }
    project_root.join(crate::consts::DEFAULT_CACHE_DIR)
  }
}
