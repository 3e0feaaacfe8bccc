//! Executable build rules.
//!
//! A `BuildRule` is what a target node becomes once its dependencies are
//! materialized: a fixed list of steps, the outputs they produce and the
//! fields that identify it in a rule key. Rules are created in dependency
//! order so a description can consult the rules it depends on.

pub mod export_file;
pub mod genrule;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::attrs::{CoerceError, SourcePath};
use crate::cell::{CellRoots, UnknownCellError};
use crate::config::KilnConfig;
use crate::consts::OUTPUT_DIR;
use crate::description::RuleType;
use crate::graph::{GraphError, TargetGraph};
use crate::rulekey::{RuleKeyAppendable, RuleKeyBuilder, RuleKeyError};
use crate::step::Step;
use crate::target::BuildTarget;
use crate::testing::TestRunOptions;
use crate::tool::{ToolError, ToolProvider};
use crate::util::paths::to_slash;

#[derive(Debug, Error)]
pub enum RuleError {
  #[error(transparent)]
  Tool(#[from] ToolError),

  #[error("{target} refers to {dependency}, which has no build rule")]
  MissingDependency { target: String, dependency: String },

  #[error("{target} has no output to refer to")]
  NoOutput { target: String },

  #[error("{target}: attribute '{attribute}': {message}")]
  InvalidArgument {
    target: String,
    attribute: String,
    message: String,
  },

  #[error(transparent)]
  Coerce(#[from] CoerceError),

  #[error(transparent)]
  Cell(#[from] UnknownCellError),

  #[error(transparent)]
  Graph(#[from] GraphError),
}

impl RuleError {
  pub fn invalid(target: &BuildTarget, attribute: &str, message: impl Into<String>) -> Self {
    RuleError::InvalidArgument {
      target: target.to_string(),
      attribute: attribute.to_string(),
      message: message.into(),
    }
  }
}

pub trait BuildRule: RuleKeyAppendable + Send + Sync + fmt::Debug {
  fn target(&self) -> &BuildTarget;

  fn rule_type(&self) -> RuleType;

  /// Every rule this one needs built first.
  fn deps(&self) -> &BTreeSet<BuildTarget>;

  fn build_steps(&self) -> Vec<Box<dyn Step>>;

  /// Files and directories the build steps produce, relative to the project root.
  fn outputs(&self) -> Vec<PathBuf>;

  fn is_cacheable(&self) -> bool {
    true
  }

  fn as_test_rule(&self) -> Option<&dyn TestRule> {
    None
  }
}

/// A rule that also has a test phase, run after its build steps.
pub trait TestRule: BuildRule {
  fn test_steps(&self, options: &TestRunOptions) -> Vec<Box<dyn Step>>;

  /// Project-relative path of the event stream written by the test phase.
  fn results_path(&self) -> PathBuf;
}

/// A source path bound to a concrete location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSourcePath {
  /// A checked-in file. `path` is project-relative for the root cell and
  /// absolute for other cells.
  File { path: PathBuf, absolute: PathBuf },
  /// The output of another rule, relative to the project root.
  Output { target: BuildTarget, path: PathBuf },
}

impl ResolvedSourcePath {
  /// The path steps should use; they resolve it against the project root.
  pub fn path(&self) -> &Path {
    match self {
      ResolvedSourcePath::File { path, .. } | ResolvedSourcePath::Output { path, .. } => path,
    }
  }

  pub fn absolute(&self, project_root: &Path) -> PathBuf {
    match self {
      ResolvedSourcePath::File { absolute, .. } => absolute.clone(),
      ResolvedSourcePath::Output { path, .. } => project_root.join(path),
    }
  }
}

impl RuleKeyAppendable for ResolvedSourcePath {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    match self {
      ResolvedSourcePath::File { absolute, .. } => {
        builder.feed_str("file");
        builder.feed_file(absolute)
      }
      ResolvedSourcePath::Output { target, path } => {
        builder.feed_str("output");
        builder.feed_dependency(target)?;
        builder.feed_str(&to_slash(path));
        Ok(())
      }
    }
  }
}

/// Project state shared by every rule description.
#[derive(Debug, Clone)]
pub struct RuleContext {
  pub cells: CellRoots,
  pub config: Arc<KilnConfig>,
  pub tools: Arc<ToolProvider>,
}

impl RuleContext {
  pub fn new(cells: CellRoots, config: Arc<KilnConfig>, tools: Arc<ToolProvider>) -> Self {
    Self { cells, config, tools }
  }

  /// Default configuration, a single cell and tools found on the ambient `PATH`.
  pub fn for_root(root: &Path) -> Self {
    let config = KilnConfig::default();
    let tools = ToolProvider::from_env(config.tools.clone(), root);
    Self::new(CellRoots::new(root), Arc::new(config), Arc::new(tools))
  }

  pub fn project_root(&self) -> &Path {
    self.cells.root()
  }
}

/// The materialized rules of a target graph.
#[derive(Debug)]
pub struct BuildRuleResolver {
  rules: BTreeMap<BuildTarget, Arc<dyn BuildRule>>,
  context: RuleContext,
}

impl BuildRuleResolver {
  pub fn new(context: RuleContext) -> Self {
    Self {
      rules: BTreeMap::new(),
      context,
    }
  }

  /// Create a rule for every node, dependencies first.
  pub async fn from_target_graph(graph: &TargetGraph, context: &RuleContext) -> Result<Self, RuleError> {
    let mut resolver = Self::new(context.clone());
    for node in graph.topological_order()? {
      let rule = node
        .description()
        .description
        .create_build_rule(&node, &resolver)
        .await?;
      debug!(target = %node.target(), rule_type = %node.rule_type(), "created build rule");
      resolver.add(rule);
    }
    Ok(resolver)
  }

  pub fn add(&mut self, rule: Arc<dyn BuildRule>) {
    self.rules.insert(rule.target().clone(), rule);
  }

  pub fn context(&self) -> &RuleContext {
    &self.context
  }

  pub fn get(&self, target: &BuildTarget) -> Option<&Arc<dyn BuildRule>> {
    self.rules.get(target)
  }

  /// The rule for `dependency`, which `target` refers to.
  pub fn require(&self, target: &BuildTarget, dependency: &BuildTarget) -> Result<&Arc<dyn BuildRule>, RuleError> {
    self.get(dependency).ok_or_else(|| RuleError::MissingDependency {
      target: target.to_string(),
      dependency: dependency.to_string(),
    })
  }

  pub fn rules(&self) -> impl Iterator<Item = &Arc<dyn BuildRule>> {
    self.rules.values()
  }

  /// The primary output of `dependency`, as referenced from `target`.
  pub fn output_of(&self, target: &BuildTarget, dependency: &BuildTarget) -> Result<PathBuf, RuleError> {
    self
      .require(target, dependency)?
      .outputs()
      .into_iter()
      .next()
      .ok_or_else(|| RuleError::NoOutput {
        target: dependency.to_string(),
      })
  }

  /// Bind a source path written in `owner`'s declaration.
  pub fn resolve_source_path(&self, owner: &BuildTarget, source: &SourcePath) -> Result<ResolvedSourcePath, RuleError> {
    match source {
      SourcePath::Path(path) => {
        let absolute = self.context.cells.root_of(owner.cell())?.join(path);
        let path = if owner.cell().is_none() {
          path.clone()
        } else {
          absolute.clone()
        };
        Ok(ResolvedSourcePath::File { path, absolute })
      }
      SourcePath::Target(dependency) => Ok(ResolvedSourcePath::Output {
        target: dependency.clone(),
        path: self.output_of(owner, dependency)?,
      }),
    }
  }
}

fn target_dir(kind: &str, target: &BuildTarget) -> PathBuf {
  let mut dir = PathBuf::from(OUTPUT_DIR).join(kind);
  if let Some(cell) = target.cell() {
    dir.push(cell);
  }
  dir.push(target.base_path_buf());
  if target.is_flavored() {
    let flavors: Vec<&str> = target.flavors().iter().map(|f| f.as_str()).collect();
    dir.push(format!("{}#{}", target.short_name(), flavors.join(",")));
  } else {
    dir.push(target.short_name());
  }
  dir
}

/// Where a rule's outputs live.
pub fn gen_dir(target: &BuildTarget) -> PathBuf {
  target_dir("gen", target)
}

/// Scratch space, cleaned before each run of the rule.
pub fn scratch_dir(target: &BuildTarget) -> PathBuf {
  target_dir("tmp", target)
}

/// Where a test rule's results go.
pub fn test_dir(target: &BuildTarget) -> PathBuf {
  target_dir("test", target)
}

/// Check an output name: relative, non-empty and inside the rule's directory.
pub fn validate_output_name(target: &BuildTarget, attribute: &str, name: &str) -> Result<PathBuf, RuleError> {
  let path = PathBuf::from(name);
  if name.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
    return Err(RuleError::invalid(
      target,
      attribute,
      format!("output '{name}' must be a relative path inside the rule's output directory"),
    ));
  }
  Ok(path)
}
