//! Implementation of the `kiln build` command.

use std::path::Path;

use anyhow::{Context, Result};

use kiln_lib::engine::{BuildSummary, RuleOutcome};
use kiln_lib::target::BuildTarget;

use super::{cancel_on_ctrl_c, load_project, runtime, with_listener};
use crate::console::{OutputFormat, Tone, elapsed, emit_json, say, stat};

/// Build every target matching `patterns`.
///
/// Returns the process exit code: 0 when every rule built or came from the
/// cache, 1 otherwise.
pub fn cmd_build(root: &Path, patterns: &[String], format: OutputFormat) -> Result<i32> {
  let project = load_project(root)?;
  let targets = project.select(patterns).context("Failed to select targets")?;
  let requested: Vec<BuildTarget> = targets.iter().cloned().collect();

  let rt = runtime()?;
  let summary = rt.block_on(async {
    let engine = project.engine(&targets).await.context("Failed to create build rules")?;
    let engine = with_listener(engine, format);
    cancel_on_ctrl_c(engine.cancellation().clone());
    engine.build(&requested).await.context("Build failed")
  })?;

  if format.is_json() {
    emit_json(&summary)?;
  } else {
    print_summary(&summary);
  }

  Ok(if summary.is_success() { 0 } else { 1 })
}

pub(super) fn print_summary(summary: &BuildSummary) {
  println!();
  stat("Built", summary.count(|o| matches!(o, RuleOutcome::Built { .. })));
  stat("Cache hits", summary.count(|o| matches!(o, RuleOutcome::CacheHit { .. })));
  stat(
    "Failed",
    summary.count(|o| matches!(o, RuleOutcome::Failed { .. } | RuleOutcome::Error { .. })),
  );
  stat(
    "Skipped",
    summary.count(|o| matches!(o, RuleOutcome::Skipped { .. } | RuleOutcome::Cancelled)),
  );
  stat("Time", elapsed(summary.duration));

  if summary.is_success() {
    say(Tone::Success, "Build succeeded");
  } else {
    say(Tone::Error, "Build failed");
  }
}
