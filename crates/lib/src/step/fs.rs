use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{ExecutionContext, Step, StepError, quote_command};
use crate::util::paths::to_slash;

/// `mkdir -p`, relative to the project root.
#[derive(Debug, Clone)]
pub struct MkdirStep {
  path: PathBuf,
}

impl MkdirStep {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }
}

#[async_trait]
impl Step for MkdirStep {
  fn short_name(&self) -> &str {
    "mkdir"
  }

  fn description(&self, _ctx: &ExecutionContext) -> String {
    quote_command(&["mkdir", "-p", to_slash(&self.path).as_str()])
  }

  async fn execute(&self, ctx: &ExecutionContext) -> Result<i32, StepError> {
    let path = ctx.resolve(&self.path);
    tokio::fs::create_dir_all(&path)
      .await
      .map_err(|e| StepError::io("failed to create directory", &path, e))?;
    Ok(0)
  }
}

/// Remove a directory if present, then recreate it empty.
#[derive(Debug, Clone)]
pub struct MakeCleanDirectoryStep {
  path: PathBuf,
}

impl MakeCleanDirectoryStep {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }
}

#[async_trait]
impl Step for MakeCleanDirectoryStep {
  fn short_name(&self) -> &str {
    "make_clean_dir"
  }

  fn description(&self, _ctx: &ExecutionContext) -> String {
    let path = to_slash(&self.path);
    format!(
      "{} && {}",
      quote_command(&["rm", "-rf", path.as_str()]),
      quote_command(&["mkdir", "-p", path.as_str()])
    )
  }

  async fn execute(&self, ctx: &ExecutionContext) -> Result<i32, StepError> {
    let path = ctx.resolve(&self.path);
    match tokio::fs::remove_dir_all(&path).await {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => return Err(StepError::io("failed to remove directory", &path, e)),
    }
    tokio::fs::create_dir_all(&path)
      .await
      .map_err(|e| StepError::io("failed to create directory", &path, e))?;
    Ok(0)
  }
}

/// Copy a file. Relative paths resolve against the project root.
#[derive(Debug, Clone)]
pub struct CopyStep {
  from: PathBuf,
  to: PathBuf,
}

impl CopyStep {
  pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
    Self {
      from: from.into(),
      to: to.into(),
    }
  }
}

#[async_trait]
impl Step for CopyStep {
  fn short_name(&self) -> &str {
    "cp"
  }

  fn description(&self, _ctx: &ExecutionContext) -> String {
    quote_command(&["cp", to_slash(&self.from).as_str(), to_slash(&self.to).as_str()])
  }

  async fn execute(&self, ctx: &ExecutionContext) -> Result<i32, StepError> {
    let from = ctx.resolve(&self.from);
    let to = ctx.resolve(&self.to);
    if let Some(parent) = to.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| StepError::io("failed to create directory", parent, e))?;
    }
    tokio::fs::copy(&from, &to)
      .await
      .map_err(|e| StepError::io("failed to copy", &from, e))?;
    Ok(0)
  }
}

/// Write fixed contents to a file.
#[derive(Debug, Clone)]
pub struct WriteFileStep {
  path: PathBuf,
  contents: String,
}

impl WriteFileStep {
  pub fn new(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      contents: contents.into(),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

#[async_trait]
impl Step for WriteFileStep {
  fn short_name(&self) -> &str {
    "write_file"
  }

  fn description(&self, _ctx: &ExecutionContext) -> String {
    format!("echo {} > {}", quote_command(&[&self.contents]), quote_command(&[to_slash(&self.path)]))
  }

  async fn execute(&self, ctx: &ExecutionContext) -> Result<i32, StepError> {
    let path = ctx.resolve(&self.path);
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| StepError::io("failed to create directory", parent, e))?;
    }
    tokio::fs::write(&path, &self.contents)
      .await
      .map_err(|e| StepError::io("failed to write", &path, e))?;
    Ok(0)
  }
}
