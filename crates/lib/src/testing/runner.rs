use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::BufReader;
use tracing::{debug, error};

use super::TestRunOptions;
use super::events::{ListTestsHandler, TestResultCollector, format_filter_params, parse_event_stream};
use super::selector::TestSelectorList;
use crate::engine::events::NoticeLevel;
use crate::process::ProcessParams;
use crate::step::{ExecutionContext, Step, StepError, quote_command};

enum Listing {
  /// Filter arguments to append to the real run.
  Filter(Vec<String>),
  /// Stop the step with this exit code without running tests.
  Stop(i32),
}

/// Runs a test tool that speaks the structured event stream.
///
/// With selectors present, the tool is first run with the list flag; the
/// listed cases are filtered and turned into filter arguments for the real
/// run. The raw event stream of each run is written to disk as it is parsed.
#[derive(Debug, Clone)]
pub struct TestRunnerStep {
  command: Vec<String>,
  env: BTreeMap<String, String>,
  selectors: TestSelectorList,
  list_flag: String,
  filter_flag: String,
  /// Project-relative destination of the real run's event stream.
  output_path: PathBuf,
  throttled: bool,
}

impl TestRunnerStep {
  pub fn new(command: Vec<String>, output_path: impl Into<PathBuf>, options: &TestRunOptions) -> Self {
    Self {
      command,
      env: BTreeMap::new(),
      selectors: options.selectors.clone(),
      list_flag: options.list_flag.clone(),
      filter_flag: options.filter_flag.clone(),
      output_path: output_path.into(),
      throttled: false,
    }
  }

  pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env = env;
    self
  }

  pub fn throttled(mut self, throttled: bool) -> Self {
    self.throttled = throttled;
    self
  }

  /// Where the list-only run's event stream goes.
  pub fn listing_path(&self) -> PathBuf {
    self.output_path.with_extension("list.jsonl")
  }

  fn program(&self) -> String {
    self
      .command
      .first()
      .map(|p| {
        Path::new(p)
          .file_name()
          .map(|n| n.to_string_lossy().into_owned())
          .unwrap_or_else(|| p.clone())
      })
      .unwrap_or_default()
  }

  fn report_exit(&self, ctx: &ExecutionContext, exit_code: i32, stderr: &str) {
    let stderr = stderr.trim();
    let message = if stderr.is_empty() {
      format!("{} failed with exit code {exit_code}", self.program())
    } else {
      format!("{} failed with exit code {exit_code}: {stderr}", self.program())
    };
    ctx.notice(NoticeLevel::Error, message);
  }

  async fn list_and_filter(&self, ctx: &ExecutionContext, base: &ProcessParams) -> Result<Listing, StepError> {
    debug!(selectors = %self.selectors.explanation(), "filtering tests");
    let mut params = base.clone();
    params.command.push(self.list_flag.clone());
    let listing_path = prepare_output(ctx, &self.listing_path()).await?;

    let (result, listed) = ctx
      .executor
      .execute_with_consumer(
        &params,
        &listing_path,
        |reader| async move {
          let mut handler = ListTestsHandler::new();
          parse_event_stream(BufReader::new(reader), &mut handler)
            .await
            .map(|()| handler.into_targets())
        },
        &ctx.cancellation,
      )
      .await?;

    if !result.success() {
      self.report_exit(ctx, result.exit_code, &result.stderr);
      ctx.notice(NoticeLevel::Error, format!("Failed to query tests with {}", self.program()));
      return Ok(Listing::Stop(result.exit_code));
    }

    let targets = match listed {
      Ok(targets) => targets,
      Err(e) => {
        ctx.notice(
          NoticeLevel::Error,
          format!("Failed to get list of tests from {}: {e}", self.program()),
        );
        return Ok(Listing::Stop(1));
      }
    };

    let filter = format_filter_params(&targets, &self.selectors, &self.filter_flag);
    if filter.is_empty() {
      ctx.notice(
        NoticeLevel::Warning,
        format!("No tests found matching specified filter ({})", self.selectors.explanation()),
      );
      return Ok(Listing::Stop(0));
    }
    Ok(Listing::Filter(filter))
  }

  async fn run(&self, ctx: &ExecutionContext) -> Result<i32, StepError> {
    let base = ProcessParams::new(self.command.clone(), ctx.project_root.clone()).with_env(ctx.environment_with(&self.env));

    let mut params = base.clone();
    if !self.selectors.is_empty() {
      match self.list_and_filter(ctx, &base).await? {
        Listing::Filter(args) => params.command.extend(args),
        Listing::Stop(code) => return Ok(code),
      }
    }

    let output_path = prepare_output(ctx, &self.output_path).await?;
    let permit = if self.throttled {
      Some(ctx.stutter_gate.acquire(&ctx.cancellation).await?)
    } else {
      None
    };
    let outcome = ctx
      .executor
      .execute_with_consumer(
        &params,
        &output_path,
        |reader| async move {
          let mut collector = TestResultCollector::new();
          let parsed = parse_event_stream(BufReader::new(reader), &mut collector).await;
          (collector, parsed)
        },
        &ctx.cancellation,
      )
      .await;
    drop(permit);

    let (result, (collector, parsed)) = outcome?;
    if let Err(e) = parsed {
      ctx.notice(
        NoticeLevel::Warning,
        format!("Could not parse test events from {}: {e}", self.program()),
      );
    }
    debug!(
      exit_code = result.exit_code,
      passed = collector.passed,
      failed = collector.failed.len(),
      "test run finished"
    );
    if !result.success() {
      self.report_exit(ctx, result.exit_code, &result.stderr);
    }
    Ok(normalize_exit_code(result.exit_code))
  }
}

/// Exit code 1 conventionally means "tests ran and some failed", which is a
/// successful step. The tool cannot tell that apart from a crash that also
/// exits with 1.
pub fn normalize_exit_code(exit_code: i32) -> i32 {
  match exit_code {
    0 | 1 => 0,
    other => other,
  }
}

async fn prepare_output(ctx: &ExecutionContext, relative: &Path) -> Result<PathBuf, StepError> {
  let path = ctx.resolve(relative);
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent)
      .await
      .map_err(|e| StepError::io("failed to create directory", parent, e))?;
  }
  Ok(path)
}

#[async_trait]
impl Step for TestRunnerStep {
  fn short_name(&self) -> &str {
    "test_runner"
  }

  fn description(&self, _ctx: &ExecutionContext) -> String {
    quote_command(&self.command)
  }

  async fn execute(&self, ctx: &ExecutionContext) -> Result<i32, StepError> {
    match self.run(ctx).await {
      Ok(code) => Ok(code),
      Err(e) if e.is_cancellation() => Err(e),
      Err(e) => {
        error!(error = %e, command = %quote_command(&self.command), "test runner failed unexpectedly");
        ctx.notice(NoticeLevel::Error, format!("{} failed unexpectedly: {e}", self.program()));
        Ok(1)
      }
    }
  }
}
