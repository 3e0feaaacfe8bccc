mod build;
mod targets;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use kiln_lib::engine::{BuildEngine, Cancellation, LoggingListener};
use kiln_lib::project::Project;

pub use build::cmd_build;
pub use targets::{TargetsOptions, cmd_targets};
pub use test::cmd_test;

use crate::console::{ConsoleListener, OutputFormat};

fn load_project(root: &Path) -> Result<Project> {
  Project::load(root).with_context(|| format!("Failed to load project at {}", root.display()))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}

/// Attach the printer matching `format`. JSON output keeps stdout for the
/// final document, so events only go to the log.
fn with_listener(engine: BuildEngine, format: OutputFormat) -> BuildEngine {
  if format.is_json() {
    engine.with_listener(std::sync::Arc::new(LoggingListener))
  } else {
    engine.with_listener(std::sync::Arc::new(ConsoleListener))
  }
}

/// Cancel the build on Ctrl-C. Must be called inside the runtime.
fn cancel_on_ctrl_c(cancellation: Cancellation) {
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupted, cancelling build");
      cancellation.cancel();
    }
  });
}
