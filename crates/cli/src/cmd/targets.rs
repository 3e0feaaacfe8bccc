//! Implementation of the `kiln targets` command.
//!
//! Lists targets, optionally narrowed to the owners of changed files and
//! widened to the tests that depend on them, with their rule keys, target
//! hashes or output paths.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use kiln_lib::graph::{PartialGraph, associated_tests, target_hashes};
use kiln_lib::project::Project;
use kiln_lib::target::BuildTarget;
use kiln_lib::util::paths::to_slash;

use super::{load_project, runtime};
use crate::console::{OutputFormat, emit_json};

#[derive(Debug, Default)]
pub struct TargetsOptions {
  pub patterns: Vec<String>,
  pub show_rulekey: bool,
  pub show_target_hash: bool,
  pub show_output: bool,
  pub referenced_files: Vec<PathBuf>,
  pub detect_test_changes: bool,
}

#[derive(Debug, Serialize)]
struct TargetInfo {
  target: String,
  #[serde(rename = "type")]
  rule_type: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  rule_key: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  target_hash: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  output: Option<String>,
}

pub fn cmd_targets(root: &Path, options: &TargetsOptions, format: OutputFormat) -> Result<i32> {
  if options.show_rulekey && options.show_target_hash {
    bail!("Cannot show rule key and target hash at the same time.");
  }

  let project = load_project(root)?;
  let listed = select_targets(&project, options)?;

  let hashes = if options.show_target_hash {
    Some(target_hashes(project.graph(), project.cells()).context("Failed to compute target hashes")?)
  } else {
    None
  };

  let mut rule_keys = BTreeMap::new();
  let mut outputs = BTreeMap::new();
  if (options.show_rulekey || options.show_output) && !listed.is_empty() {
    let rt = runtime()?;
    rt.block_on(async {
      let engine = project.engine(&listed).await.context("Failed to create build rules")?;
      for target in &listed {
        if options.show_rulekey {
          let key = engine
            .rule_key(target)
            .with_context(|| format!("Failed to compute rule key of {target}"))?;
          rule_keys.insert(target.clone(), key.to_hex());
        }
        if options.show_output
          && let Some(rule) = engine.resolver().get(target)
          && let Some(output) = rule.outputs().into_iter().next()
        {
          outputs.insert(target.clone(), to_slash(&output));
        }
      }
      anyhow::Ok(())
    })?;
  }

  let infos: Vec<TargetInfo> = listed
    .iter()
    .map(|target| TargetInfo {
      target: target.to_string(),
      rule_type: project
        .graph()
        .get(target)
        .map(|node| node.rule_type().to_string())
        .unwrap_or_default(),
      rule_key: rule_keys.get(target).cloned(),
      target_hash: hashes.as_ref().and_then(|h| h.get(target)).map(|h| h.0.clone()),
      output: outputs.get(target).cloned(),
    })
    .collect();

  if format.is_json() {
    emit_json(&infos)?;
  } else {
    for info in &infos {
      let mut line = info.target.clone();
      for extra in [&info.rule_key, &info.target_hash, &info.output].into_iter().flatten() {
        line.push(' ');
        line.push_str(extra);
      }
      println!("{line}");
    }
  }

  Ok(0)
}

fn select_targets(project: &Project, options: &TargetsOptions) -> Result<BTreeSet<BuildTarget>> {
  let mut candidates = if options.patterns.is_empty() {
    project.graph().targets()
  } else {
    project.select(&options.patterns).context("Failed to select targets")?
  };

  if !options.referenced_files.is_empty() {
    let mut owners = BTreeSet::new();
    for file in &options.referenced_files {
      owners.extend(project.graph().owners_of(&project_relative(project.root(), file)));
    }
    candidates.retain(|target| owners.contains(target));
  }

  if options.detect_test_changes {
    let partial = PartialGraph::create(
      project.graph(),
      |node| candidates.contains(node.target()),
      associated_tests,
    )
    .context("Failed to find associated tests")?;
    return Ok(partial.selected().clone());
  }

  Ok(candidates)
}

/// `file` relative to the project root. Relative paths are taken as already
/// relative to the root.
fn project_relative(root: &Path, file: &Path) -> PathBuf {
  if file.is_absolute() {
    let file = dunce::canonicalize(file).unwrap_or_else(|_| file.to_path_buf());
    if let Ok(relative) = file.strip_prefix(root) {
      return relative.to_path_buf();
    }
    return file;
  }
  file
    .components()
    .filter(|c| !matches!(c, Component::CurDir))
    .collect()
}
