//! Launching external processes.
//!
//! Every process gets an explicit working directory and an explicit, complete
//! environment. Both output streams are always drained before the exit
//! status is awaited, and a cancelled wait kills the child before returning.

pub mod tee;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::engine::Cancellation;

pub use tee::{TeeSummary, tee};

/// Buffer between the tee reader and a consumer.
const CONSUMER_PIPE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProcessError {
  #[error("cannot launch an empty command")]
  EmptyCommand,

  #[error("failed to launch {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("I/O error while running {program}: {source}")]
  Io {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write output of {program} to {path}: {source}")]
  Output {
    program: String,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{program} was cancelled")]
  Cancelled { program: String },
}

/// What to do with a process's standard output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StdoutHandling {
  #[default]
  Discard,
  /// Keep it in memory and return it.
  Capture,
  /// Write it verbatim to a file.
  File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ProcessParams {
  pub command: Vec<String>,
  /// The complete environment; nothing is inherited.
  pub env: BTreeMap<String, String>,
  pub cwd: PathBuf,
  pub stdout: StdoutHandling,
}

impl ProcessParams {
  pub fn new(command: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
    Self {
      command,
      env: BTreeMap::new(),
      cwd: cwd.into(),
      stdout: StdoutHandling::Discard,
    }
  }

  pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env = env;
    self
  }

  pub fn with_stdout(mut self, stdout: StdoutHandling) -> Self {
    self.stdout = stdout;
    self
  }

  pub fn program(&self) -> &str {
    self.command.first().map(String::as_str).unwrap_or("")
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
  pub exit_code: i32,
  /// Present for `StdoutHandling::Capture`.
  pub stdout: Option<String>,
  pub stderr: String,
}

impl ProcessResult {
  pub fn success(&self) -> bool {
    self.exit_code == 0
  }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
  pub fn new() -> Self {
    Self
  }

  /// Spawn the process with stderr piped and stdout set up per `params`.
  pub fn launch(&self, params: &ProcessParams) -> Result<Child, ProcessError> {
    let (program, args) = params.command.split_first().ok_or(ProcessError::EmptyCommand)?;
    let stdout = match params.stdout {
      StdoutHandling::Discard => Stdio::null(),
      StdoutHandling::Capture | StdoutHandling::File(_) => Stdio::piped(),
    };

    debug!(program = %program, cwd = ?params.cwd, "launching process");
    Command::new(program)
      .args(args)
      .current_dir(&params.cwd)
      .env_clear()
      .envs(&params.env)
      .stdin(Stdio::null())
      .stdout(stdout)
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
      })
  }

  /// Run to completion.
  pub async fn execute(&self, params: &ProcessParams, cancel: &Cancellation) -> Result<ProcessResult, ProcessError> {
    let program = params.program().to_string();
    let mut child = self.launch(params)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let run = async {
      let stdout_task = async {
        match (&params.stdout, stdout) {
          (StdoutHandling::Capture, Some(out)) => read_to_string(out).await.map(Some),
          (StdoutHandling::File(path), Some(out)) => tee(out, path, None).await.map(|_| None),
          _ => Ok(None),
        }
      };
      let (captured, stderr) = tokio::join!(stdout_task, read_optional(stderr));
      let captured = captured.map_err(|source| output_error(&program, &params.stdout, source))?;
      let stderr = stderr.map_err(|source| io_error(&program, source))?;
      let status = child.wait().await.map_err(|source| io_error(&program, source))?;
      Ok(ProcessResult {
        exit_code: exit_code(status),
        stdout: captured,
        stderr,
      })
    };

    let result = guard_cancel(run, cancel, &program).await;
    reap_if_cancelled(&mut child, &result).await;
    result
  }

  /// Run to completion, writing stdout verbatim to `tee_path` while also
  /// streaming it to `consumer`. The file is complete even when the consumer
  /// stops reading early.
  pub async fn execute_with_consumer<F, Fut, T>(
    &self,
    params: &ProcessParams,
    tee_path: &Path,
    consumer: F,
    cancel: &Cancellation,
  ) -> Result<(ProcessResult, T), ProcessError>
  where
    F: FnOnce(DuplexStream) -> Fut,
    Fut: Future<Output = T>,
  {
    let program = params.program().to_string();
    let params = params.clone().with_stdout(StdoutHandling::File(tee_path.to_path_buf()));
    let mut child = self.launch(&params)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (writer, reader) = tokio::io::duplex(CONSUMER_PIPE_SIZE);

    let run = async {
      let tee_task = async {
        match stdout {
          Some(out) => tee(out, tee_path, Some(writer)).await.map(Some),
          None => Ok(None),
        }
      };
      let (teed, consumed, stderr) = tokio::join!(tee_task, consumer(reader), read_optional(stderr));
      let teed = teed.map_err(|source| ProcessError::Output {
        program: program.clone(),
        path: tee_path.to_path_buf(),
        source,
      })?;
      if let Some(summary) = teed
        && !summary.consumer_complete
      {
        debug!(program = %program, bytes = summary.bytes, "consumer stopped before end of output");
      }
      let stderr = stderr.map_err(|source| io_error(&program, source))?;
      let status = child.wait().await.map_err(|source| io_error(&program, source))?;
      Ok((
        ProcessResult {
          exit_code: exit_code(status),
          stdout: None,
          stderr,
        },
        consumed,
      ))
    };

    let result = guard_cancel(run, cancel, &program).await;
    reap_if_cancelled(&mut child, &result).await;
    result
  }
}

/// Race `run` against cancellation.
async fn guard_cancel<T>(
  run: impl Future<Output = Result<T, ProcessError>>,
  cancel: &Cancellation,
  program: &str,
) -> Result<T, ProcessError> {
  tokio::select! {
    biased;
    _ = cancel.cancelled() => {
      warn!(program = %program, "cancelled, killing process");
      Err(ProcessError::Cancelled { program: program.to_string() })
    }
    result = run => result,
  }
}

async fn reap_if_cancelled<T>(child: &mut Child, result: &Result<T, ProcessError>) {
  if matches!(result, Err(ProcessError::Cancelled { .. }))
    && let Err(e) = child.kill().await
  {
    warn!(error = %e, "failed to kill cancelled process");
  }
}

async fn read_to_string<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<String> {
  let mut bytes = Vec::new();
  reader.read_to_end(&mut bytes).await?;
  Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn read_optional<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
  match reader {
    Some(reader) => read_to_string(reader).await,
    None => Ok(String::new()),
  }
}

fn io_error(program: &str, source: std::io::Error) -> ProcessError {
  ProcessError::Io {
    program: program.to_string(),
    source,
  }
}

fn output_error(program: &str, handling: &StdoutHandling, source: std::io::Error) -> ProcessError {
  match handling {
    StdoutHandling::File(path) => ProcessError::Output {
      program: program.to_string(),
      path: path.clone(),
      source,
    },
    _ => io_error(program, source),
  }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
  use std::os::unix::process::ExitStatusExt;
  status.code().or_else(|| status.signal().map(|s| 128 + s)).unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
  status.code().unwrap_or(1)
}
