//! Steps: the atomic units of build work.
//!
//! A rule's steps run strictly in order, each seeing the filesystem state its
//! predecessors left. `execute` returns the step's exit code; an `Err` is
//! reserved for conditions that are not a tool's verdict, such as I/O
//! failures and cancellation.

pub mod fs;
pub mod shell;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::engine::events::{BuildEvent, BuildEventListener, LoggingListener, NoticeLevel};
use crate::engine::Cancellation;
use crate::process::{ProcessError, ProcessExecutor};
use crate::target::BuildTarget;
use crate::throttle::{GateCancelled, StutterGate};

pub use fs::{CopyStep, MakeCleanDirectoryStep, MkdirStep, WriteFileStep};
pub use shell::ShellStep;

#[derive(Debug, Error)]
pub enum StepError {
  #[error("{action} {path}: {source}")]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Process(#[from] ProcessError),

  #[error("step {step} was cancelled")]
  Cancelled { step: String },
}

impl StepError {
  pub fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
    StepError::Io {
      action,
      path: path.to_path_buf(),
      source,
    }
  }

  pub fn is_cancellation(&self) -> bool {
    matches!(
      self,
      StepError::Cancelled { .. } | StepError::Process(ProcessError::Cancelled { .. })
    )
  }
}

impl From<GateCancelled> for StepError {
  fn from(_: GateCancelled) -> Self {
    StepError::Cancelled {
      step: "stutter gate".to_string(),
    }
  }
}

#[async_trait]
pub trait Step: Send + Sync + fmt::Debug {
  /// Machine-readable name, e.g. `mkdir` or `genrule`.
  fn short_name(&self) -> &str;

  /// The exact invocation this step performs in `ctx`.
  fn description(&self, ctx: &ExecutionContext) -> String;

  async fn execute(&self, ctx: &ExecutionContext) -> Result<i32, StepError>;
}

/// Everything a step may touch while it runs.
#[derive(Clone)]
pub struct ExecutionContext {
  pub project_root: PathBuf,
  /// Base environment handed to every process; steps overlay their own entries.
  pub env: BTreeMap<String, String>,
  pub executor: ProcessExecutor,
  pub stutter_gate: Arc<StutterGate>,
  pub listener: Arc<dyn BuildEventListener>,
  pub cancellation: Cancellation,
  /// The rule whose steps are running.
  pub target: Option<BuildTarget>,
}

impl fmt::Debug for ExecutionContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExecutionContext")
      .field("project_root", &self.project_root)
      .field("target", &self.target)
      .finish_non_exhaustive()
  }
}

impl ExecutionContext {
  /// A context with an empty base environment, no throttling and logging only.
  pub fn new(project_root: impl Into<PathBuf>) -> Self {
    Self {
      project_root: project_root.into(),
      env: BTreeMap::new(),
      executor: ProcessExecutor::new(),
      stutter_gate: Arc::new(StutterGate::new(None)),
      listener: Arc::new(LoggingListener),
      cancellation: Cancellation::new(),
      target: None,
    }
  }

  /// Copy the listed variables from the ambient environment into the base environment.
  pub fn with_inherited_env<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
    for name in names {
      if let Ok(value) = std::env::var(name) {
        self.env.insert(name.to_string(), value);
      }
    }
    self
  }

  pub fn with_listener(mut self, listener: Arc<dyn BuildEventListener>) -> Self {
    self.listener = listener;
    self
  }

  pub fn with_stutter_gate(mut self, gate: Arc<StutterGate>) -> Self {
    self.stutter_gate = gate;
    self
  }

  pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
    self.cancellation = cancellation;
    self
  }

  pub fn for_target(&self, target: &BuildTarget) -> Self {
    Self {
      target: Some(target.clone()),
      ..self.clone()
    }
  }

  /// Resolve a project-relative path.
  pub fn resolve(&self, path: &Path) -> PathBuf {
    self.project_root.join(path)
  }

  /// The base environment overlaid with `overlay`.
  pub fn environment_with(&self, overlay: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = self.env.clone();
    env.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
  }

  pub fn post(&self, event: BuildEvent) {
    self.listener.on_event(&event);
  }

  /// A user-facing message attributed to the current rule.
  pub fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
    self.post(BuildEvent::Notice {
      target: self.target.clone(),
      level,
      message: message.into(),
    });
  }
}

/// Run `steps` in order, stopping at the first non-zero exit code.
/// Returns the failing step's short name and exit code, if any.
pub async fn run_steps(steps: &[Box<dyn Step>], ctx: &ExecutionContext) -> Result<Option<(String, i32)>, StepError> {
  for step in steps {
    if ctx.cancellation.is_cancelled() {
      return Err(StepError::Cancelled {
        step: step.short_name().to_string(),
      });
    }
    ctx.post(BuildEvent::StepStarted {
      target: ctx.target.clone(),
      short_name: step.short_name().to_string(),
      description: step.description(ctx),
    });
    let exit_code = step.execute(ctx).await?;
    ctx.post(BuildEvent::StepFinished {
      target: ctx.target.clone(),
      short_name: step.short_name().to_string(),
      exit_code,
    });
    if exit_code != 0 {
      return Ok(Some((step.short_name().to_string(), exit_code)));
    }
  }
  Ok(None)
}

/// Render a command line the way a shell user would type it.
pub fn quote_command<S: AsRef<str>>(command: &[S]) -> String {
  command
    .iter()
    .map(|arg| {
      shlex::try_quote(arg.as_ref())
        .map(|quoted| quoted.into_owned())
        .unwrap_or_else(|_| arg.as_ref().to_string())
    })
    .collect::<Vec<_>>()
    .join(" ")
}
