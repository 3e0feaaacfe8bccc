use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{ExecutionContext, Step, StepError, quote_command};
use crate::engine::events::NoticeLevel;
use crate::process::{ProcessParams, StdoutHandling};

/// Runs an external command. A non-zero exit code is returned as-is.
#[derive(Debug, Clone)]
pub struct ShellStep {
  short_name: String,
  command: Vec<String>,
  env: BTreeMap<String, String>,
  /// Relative to the project root; the root itself when unset.
  cwd: Option<PathBuf>,
  stdout: StdoutHandling,
  throttled: bool,
}

impl ShellStep {
  pub fn new(short_name: impl Into<String>, command: Vec<String>) -> Self {
    Self {
      short_name: short_name.into(),
      command,
      env: BTreeMap::new(),
      cwd: None,
      stdout: StdoutHandling::Discard,
      throttled: false,
    }
  }

  pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env = env;
    self
  }

  pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
    self.cwd = Some(cwd.into());
    self
  }

  pub fn with_stdout(mut self, stdout: StdoutHandling) -> Self {
    self.stdout = stdout;
    self
  }

  /// Pass through the stutter gate before launching.
  pub fn throttled(mut self, throttled: bool) -> Self {
    self.throttled = throttled;
    self
  }

  pub fn command(&self) -> &[String] {
    &self.command
  }

  pub fn env(&self) -> &BTreeMap<String, String> {
    &self.env
  }

  fn params(&self, ctx: &ExecutionContext) -> ProcessParams {
    let cwd = match &self.cwd {
      Some(cwd) => ctx.resolve(cwd),
      None => ctx.project_root.clone(),
    };
    let stdout = match &self.stdout {
      StdoutHandling::File(path) => StdoutHandling::File(ctx.resolve(path)),
      other => other.clone(),
    };
    ProcessParams::new(self.command.clone(), cwd)
      .with_env(ctx.environment_with(&self.env))
      .with_stdout(stdout)
  }
}

#[async_trait]
impl Step for ShellStep {
  fn short_name(&self) -> &str {
    &self.short_name
  }

  fn description(&self, _ctx: &ExecutionContext) -> String {
    let assignments: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={}", quote_command(&[v]))).collect();
    let command = quote_command(&self.command);
    if assignments.is_empty() {
      command
    } else {
      format!("env {} {command}", assignments.join(" "))
    }
  }

  async fn execute(&self, ctx: &ExecutionContext) -> Result<i32, StepError> {
    let params = self.params(ctx);
    let _permit = if self.throttled {
      Some(ctx.stutter_gate.acquire(&ctx.cancellation).await?)
    } else {
      None
    };
    let result = ctx.executor.execute(&params, &ctx.cancellation).await?;
    debug!(step = %self.short_name, exit_code = result.exit_code, "process exited");
    if !result.success() && !result.stderr.trim().is_empty() {
      ctx.notice(NoticeLevel::Error, result.stderr.trim_end().to_string());
    }
    Ok(result.exit_code)
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::engine::events::RecordingListener;
  use crate::throttle::StutterGate;
  use std::sync::Arc;
  use std::time::{Duration, Instant};

  #[tokio::test]
  async fn env_overlays_base_environment() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = ExecutionContext::new(dir.path());
    ctx.env.insert("BASE".into(), "1".into());
    ctx.env.insert("SHARED".into(), "base".into());

    let step = ShellStep::new("show", vec!["/bin/sh".into(), "-c".into(), "echo $BASE $SHARED > out.txt".into()])
      .with_env(BTreeMap::from([("SHARED".to_string(), "step".to_string())]));
    assert_eq!(step.execute(&ctx).await.unwrap(), 0);
    assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "1 step\n");
  }

  #[tokio::test]
  async fn failure_surfaces_stderr_and_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let listener = Arc::new(RecordingListener::new());
    let ctx = ExecutionContext::new(dir.path()).with_listener(listener.clone());

    let step = ShellStep::new("boom", vec!["/bin/sh".into(), "-c".into(), "echo broken >&2; exit 7".into()]);
    assert_eq!(step.execute(&ctx).await.unwrap(), 7);
    assert_eq!(listener.notices(), vec!["broken".to_string()]);
  }

  #[tokio::test]
  async fn throttled_launches_are_spaced_by_the_stutter_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let timeout = Duration::from_millis(300);
    let ctx = ExecutionContext::new(dir.path())
      .with_inherited_env(["PATH"])
      .with_stutter_gate(Arc::new(StutterGate::new(Some(timeout))));
    let step = ShellStep::new("slow", vec!["/bin/sh".into(), "-c".into(), "echo up >> launches; sleep 2".into()])
      .throttled(true);

    let log = dir.path().join("launches");
    let start = Instant::now();
    let watch = async {
      let mut seen = Vec::new();
      while seen.len() < 2 && start.elapsed() < Duration::from_secs(10) {
        let launched = std::fs::read_to_string(&log).map(|s| s.lines().count()).unwrap_or(0);
        while seen.len() < launched {
          seen.push(start.elapsed());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
      seen
    };
    let (first, second, seen) = tokio::join!(step.execute(&ctx), step.execute(&ctx), watch);
    assert_eq!(first.unwrap(), 0);
    assert_eq!(second.unwrap(), 0);

    assert_eq!(seen.len(), 2);
    // The second process starts no earlier than the timeout after the first
    // acquisition, and without waiting for the first one to exit.
    assert!(seen[1] >= timeout, "second launch after {:?}", seen[1]);
    assert!(seen[1] < Duration::from_secs(2), "second launch after {:?}", seen[1]);
  }

  #[test]
  fn description_shows_env_and_quoted_command() {
    let ctx = ExecutionContext::new("/tmp");
    let step = ShellStep::new("gen", vec!["/bin/sh".into(), "-c".into(), "cat $SRCS".into()])
      .with_env(BTreeMap::from([("OUT".to_string(), "a b".to_string())]));
    assert_eq!(step.description(&ctx), "env OUT='a b' /bin/sh -c 'cat $SRCS'");
  }
}
