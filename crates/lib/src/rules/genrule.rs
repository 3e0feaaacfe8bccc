//! `genrule`: run a shell command that produces one output.
//!
//! The command sees `SRCS` (space-separated absolute source paths), `OUT`
//! (absolute output path) and `TMP` (an empty scratch directory). A
//! `$(location //pkg:target)` macro expands to the absolute path of that
//! target's output and makes the target a dependency.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::json;

use super::{BuildRule, BuildRuleResolver, ResolvedSourcePath, RuleError, gen_dir, scratch_dir, validate_output_name};
use crate::attrs::{AttrSpec, AttrType, CoerceError, ConstructorArg, RuleSchema};
use crate::description::{Description, RuleType};
use crate::node::TargetNode;
use crate::rulekey::{RuleKeyAppendable, RuleKeyBuilder, RuleKeyError};
use crate::step::{MakeCleanDirectoryStep, ShellStep, Step};
use crate::target::BuildTarget;
use crate::tool::Tool;
use crate::util::paths::to_slash;

pub const RULE_TYPE: &str = "genrule";

static LOCATION_MACRO: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"\$\(location\s+([^)\s]+)\)").expect("location macro pattern is valid"));

/// Targets named by `$(location ...)` macros in `cmd`.
pub fn location_targets(owner: &BuildTarget, cmd: &str) -> Result<BTreeSet<BuildTarget>, CoerceError> {
  LOCATION_MACRO
    .captures_iter(cmd)
    .map(|captures| {
      BuildTarget::parse_relative(&captures[1], Some(owner)).map_err(|e| CoerceError::InvalidValue {
        target: owner.to_string(),
        attribute: "cmd".to_string(),
        message: e.to_string(),
      })
    })
    .collect()
}

#[derive(Debug)]
pub struct GenruleDescription;

#[async_trait]
impl Description for GenruleDescription {
  fn rule_type(&self) -> RuleType {
    RuleType::new(RULE_TYPE)
  }

  fn schema(&self) -> RuleSchema {
    RuleSchema::new([
      AttrSpec::new("srcs", AttrType::list(AttrType::SourcePath)).with_default(json!([])),
      AttrSpec::new("cmd", AttrType::String),
      AttrSpec::new("out", AttrType::String),
      AttrSpec::new("cacheable", AttrType::Bool).with_default(json!(true)).not_walked(),
    ])
  }

  fn infer_implicit_deps(&self, target: &BuildTarget, arg: &ConstructorArg) -> Result<BTreeSet<BuildTarget>, CoerceError> {
    location_targets(target, arg.string("cmd").unwrap_or_default())
  }

  async fn create_build_rule(
    &self,
    node: &TargetNode,
    resolver: &BuildRuleResolver,
  ) -> Result<Arc<dyn BuildRule>, RuleError> {
    let target = node.target().clone();
    let arg = node.constructor_arg();
    let project_root = resolver.context().project_root().to_path_buf();

    let cmd = arg.string("cmd").unwrap_or_default().to_string();
    let out = validate_output_name(&target, "out", arg.string("out").unwrap_or_default())?;
    let srcs = arg
      .source_paths("srcs")
      .iter()
      .map(|source| resolver.resolve_source_path(&target, source))
      .collect::<Result<Vec<_>, _>>()?;

    let mut locations = BTreeMap::new();
    for dependency in location_targets(&target, &cmd)? {
      let output = resolver.output_of(&target, &dependency)?;
      locations.insert(dependency, project_root.join(output));
    }
    let expanded_cmd = LOCATION_MACRO
      .replace_all(&cmd, |captures: &Captures<'_>| {
        BuildTarget::parse_relative(&captures[1], Some(&target))
          .ok()
          .and_then(|dependency| locations.get(&dependency))
          .map(|path| to_slash(path))
          .unwrap_or_else(|| captures[0].to_string())
      })
      .into_owned();

    let shell = resolver.context().tools.get("sh", "sh", &["--version"]).await?;

    Ok(Arc::new(Genrule {
      deps: node.deps(),
      cacheable: arg.bool_or("cacheable", true),
      target,
      cmd,
      expanded_cmd,
      out,
      srcs,
      shell,
      project_root,
    }))
  }
}

#[derive(Debug)]
pub struct Genrule {
  target: BuildTarget,
  deps: BTreeSet<BuildTarget>,
  cmd: String,
  expanded_cmd: String,
  out: PathBuf,
  srcs: Vec<ResolvedSourcePath>,
  shell: Arc<dyn Tool>,
  cacheable: bool,
  project_root: PathBuf,
}

impl Genrule {
  pub fn output_path(&self) -> PathBuf {
    gen_dir(&self.target).join(&self.out)
  }

  fn absolute(&self, path: &Path) -> String {
    to_slash(&self.project_root.join(path))
  }

  fn environment(&self) -> BTreeMap<String, String> {
    let srcs: Vec<String> = self
      .srcs
      .iter()
      .map(|source| to_slash(&source.absolute(&self.project_root)))
      .collect();
    let mut env = self.shell.environment();
    env.insert("SRCS".to_string(), srcs.join(" "));
    env.insert("OUT".to_string(), self.absolute(&self.output_path()));
    env.insert("TMP".to_string(), self.absolute(&scratch_dir(&self.target)));
    env
  }
}

impl RuleKeyAppendable for Genrule {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder
      .set("cmd", &self.cmd)?
      .set("out", &self.out)?
      .set("srcs", &self.srcs)?
      .set("shell", self.shell.as_ref())?;
    Ok(())
  }
}

impl BuildRule for Genrule {
  fn target(&self) -> &BuildTarget {
    &self.target
  }

  fn rule_type(&self) -> RuleType {
    RuleType::new(RULE_TYPE)
  }

  fn deps(&self) -> &BTreeSet<BuildTarget> {
    &self.deps
  }

  fn build_steps(&self) -> Vec<Box<dyn Step>> {
    let mut command = self.shell.command_prefix();
    command.push("-c".to_string());
    command.push(self.expanded_cmd.clone());
    vec![
      Box::new(MakeCleanDirectoryStep::new(gen_dir(&self.target))),
      Box::new(MakeCleanDirectoryStep::new(scratch_dir(&self.target))),
      Box::new(ShellStep::new(RULE_TYPE, command).with_env(self.environment())),
    ]
  }

  fn outputs(&self) -> Vec<PathBuf> {
    vec![self.output_path()]
  }

  fn is_cacheable(&self) -> bool {
    self.cacheable
  }
}
