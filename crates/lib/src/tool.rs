//! External tools.
//!
//! A `Tool` is an executable plus the command-line prefix and environment it
//! contributes to steps. Its identity feeds rule keys: the self-reported
//! version when one is available, otherwise the hash of the executable, so a
//! silently replaced binary still invalidates cached outputs.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::consts::CONFIG_FILE_NAME;
use crate::platform::find_executable;
use crate::rulekey::{RuleKeyAppendable, RuleKeyBuilder, RuleKeyError};
use crate::util::hash::{ContentHash, HashError, hash_file};

#[derive(Debug, Error)]
pub enum ToolError {
  #[error("No {name} found in {config} (tools.{name}) or on system")]
  NotFound { name: String, config: &'static str },

  #[error("configured tool {name} does not exist at {path}")]
  MissingConfiguredPath { name: String, path: PathBuf },

  #[error("failed to hash tool {name}: {source}")]
  Hash {
    name: String,
    #[source]
    source: HashError,
  },
}

/// How a tool identifies itself in rule keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ToolIdentity {
  Version(String),
  ContentHash(ContentHash),
}

impl fmt::Display for ToolIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ToolIdentity::Version(v) => write!(f, "version {v}"),
      ToolIdentity::ContentHash(h) => write!(f, "sha256 {h}"),
    }
  }
}

pub trait Tool: Send + Sync + fmt::Debug {
  fn name(&self) -> &str;

  /// Arguments that start every invocation of the tool.
  fn command_prefix(&self) -> Vec<String>;

  fn environment(&self) -> BTreeMap<String, String> {
    BTreeMap::new()
  }

  fn identity(&self) -> ToolIdentity;
}

impl RuleKeyAppendable for dyn Tool + '_ {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.feed_str(self.name());
    match self.identity() {
      ToolIdentity::Version(version) => {
        builder.feed_str("version");
        builder.feed_str(&version);
      }
      ToolIdentity::ContentHash(hash) => {
        builder.feed_str("hash");
        builder.feed_str(&hash.0);
      }
    }
    builder.set("env", &self.environment())?;
    Ok(())
  }
}

/// A tool with a known version string.
#[derive(Debug, Clone)]
pub struct VersionedTool {
  name: String,
  path: PathBuf,
  version: String,
  extra_args: Vec<String>,
  env: BTreeMap<String, String>,
}

impl VersionedTool {
  pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      path: path.into(),
      version: version.into(),
      extra_args: Vec::new(),
      env: BTreeMap::new(),
    }
  }

  pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
    self.extra_args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }

  pub fn version(&self) -> &str {
    &self.version
  }
}

impl Tool for VersionedTool {
  fn name(&self) -> &str {
    &self.name
  }

  fn command_prefix(&self) -> Vec<String> {
    std::iter::once(self.path.to_string_lossy().into_owned())
      .chain(self.extra_args.iter().cloned())
      .collect()
  }

  fn environment(&self) -> BTreeMap<String, String> {
    self.env.clone()
  }

  fn identity(&self) -> ToolIdentity {
    ToolIdentity::Version(self.version.clone())
  }
}

/// A tool identified by the bytes of its executable.
#[derive(Debug, Clone)]
pub struct HashedFileTool {
  name: String,
  path: PathBuf,
  hash: ContentHash,
}

impl HashedFileTool {
  pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, ToolError> {
    let name = name.into();
    let path = path.into();
    let hash = hash_file(&path).map_err(|source| ToolError::Hash {
      name: name.clone(),
      source,
    })?;
    Ok(Self { name, path, hash })
  }
}

impl Tool for HashedFileTool {
  fn name(&self) -> &str {
    &self.name
  }

  fn command_prefix(&self) -> Vec<String> {
    vec![self.path.to_string_lossy().into_owned()]
  }

  fn identity(&self) -> ToolIdentity {
    ToolIdentity::ContentHash(self.hash.clone())
  }
}

/// A tool on disk whose version is read by running it.
pub struct ExternalTool;

impl ExternalTool {
  /// Run `path version_args...` once and use the first non-empty output line
  /// as the version. A failed version query or empty output falls back to hashing the
  /// executable.
  pub async fn detect(name: &str, path: &Path, version_args: &[&str]) -> Result<Arc<dyn Tool>, ToolError> {
    match query_version(path, version_args).await {
      Some(version) => {
        debug!(tool = name, path = ?path, version = %version, "detected tool version");
        Ok(Arc::new(VersionedTool::new(name, path, version)))
      }
      None => {
        debug!(tool = name, path = ?path, "no version reported, hashing executable");
        Ok(Arc::new(HashedFileTool::new(name, path)?))
      }
    }
  }
}

async fn query_version(path: &Path, version_args: &[&str]) -> Option<String> {
  if version_args.is_empty() {
    return None;
  }
  let output = Command::new(path)
    .args(version_args)
    .stdin(Stdio::null())
    .kill_on_drop(true)
    .output()
    .await
    .ok()?;
  if !output.status.success() {
    return None;
  }
  let text = if output.stdout.is_empty() {
    output.stderr
  } else {
    output.stdout
  };
  String::from_utf8_lossy(&text)
    .lines()
    .map(str::trim)
    .find(|line| !line.is_empty())
    .map(str::to_string)
}

/// Locate the executable for `name`: the `[tools]` entry when configured
/// (relative paths resolve against `root`), else `default_executable` on
/// `path_var`.
pub fn resolve_tool(
  tools: &BTreeMap<String, PathBuf>,
  root: &Path,
  name: &str,
  default_executable: &str,
  path_var: Option<&std::ffi::OsStr>,
) -> Result<PathBuf, ToolError> {
  if let Some(configured) = tools.get(name) {
    let path = root.join(configured);
    return if path.is_file() {
      Ok(path)
    } else {
      Err(ToolError::MissingConfiguredPath {
        name: name.to_string(),
        path,
      })
    };
  }
  find_executable(default_executable, path_var).ok_or_else(|| ToolError::NotFound {
    name: name.to_string(),
    config: CONFIG_FILE_NAME,
  })
}

/// Resolves and memoizes tools for one project.
#[derive(Debug)]
pub struct ToolProvider {
  tools: BTreeMap<String, PathBuf>,
  root: PathBuf,
  path_var: Option<OsString>,
  resolved: Mutex<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolProvider {
  pub fn new(tools: BTreeMap<String, PathBuf>, root: impl Into<PathBuf>, path_var: Option<OsString>) -> Self {
    Self {
      tools,
      root: root.into(),
      path_var,
      resolved: Mutex::new(HashMap::new()),
    }
  }

  /// A provider searching the ambient `PATH`.
  pub fn from_env(tools: BTreeMap<String, PathBuf>, root: impl Into<PathBuf>) -> Self {
    Self::new(tools, root, std::env::var_os("PATH"))
  }

  pub async fn get(&self, name: &str, default_executable: &str, version_args: &[&str]) -> Result<Arc<dyn Tool>, ToolError> {
    let mut resolved = self.resolved.lock().await;
    if let Some(tool) = resolved.get(name) {
      return Ok(tool.clone());
    }
    let path = resolve_tool(&self.tools, &self.root, name, default_executable, self.path_var.as_deref())?;
    let tool = ExternalTool::detect(name, &path, version_args).await?;
    resolved.insert(name.to_string(), tool.clone());
    Ok(tool)
  }
}
