//! `export_file`: make a checked-in file (or another rule's output)
//! available under the output tree.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::{BuildRule, BuildRuleResolver, ResolvedSourcePath, RuleError, gen_dir, validate_output_name};
use crate::attrs::{AttrSpec, AttrType, CoerceError, ConstructorArg, RuleSchema, SourcePath};
use crate::description::{Description, RuleType};
use crate::node::TargetNode;
use crate::rulekey::{RuleKeyAppendable, RuleKeyBuilder, RuleKeyError};
use crate::step::{CopyStep, MakeCleanDirectoryStep, Step};
use crate::target::BuildTarget;

pub const RULE_TYPE: &str = "export_file";

#[derive(Debug)]
pub struct ExportFileDescription;

/// A missing `src` names the file after the target.
fn implied_src(target: &BuildTarget) -> PathBuf {
  target.base_path_buf().join(target.short_name())
}

#[async_trait]
impl Description for ExportFileDescription {
  fn rule_type(&self) -> RuleType {
    RuleType::new(RULE_TYPE)
  }

  fn schema(&self) -> RuleSchema {
    RuleSchema::new([
      AttrSpec::optional("src", AttrType::SourcePath),
      AttrSpec::optional("out", AttrType::String),
    ])
  }

  fn infer_implicit_inputs(&self, target: &BuildTarget, arg: &ConstructorArg) -> Result<BTreeSet<PathBuf>, CoerceError> {
    if arg.source_path("src").is_some() {
      return Ok(BTreeSet::new());
    }
    Ok(BTreeSet::from([implied_src(target)]))
  }

  async fn create_build_rule(
    &self,
    node: &TargetNode,
    resolver: &BuildRuleResolver,
  ) -> Result<Arc<dyn BuildRule>, RuleError> {
    let target = node.target().clone();
    let arg = node.constructor_arg();

    let src = match arg.source_path("src") {
      Some(src) => src.clone(),
      None => SourcePath::Path(implied_src(&target)),
    };
    let src = resolver.resolve_source_path(&target, &src)?;

    let default_out = src
      .path()
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| target.short_name().to_string());
    let out = validate_output_name(&target, "out", arg.string("out").unwrap_or(&default_out))?;

    Ok(Arc::new(ExportFile {
      deps: node.deps(),
      target,
      src,
      out,
    }))
  }
}

#[derive(Debug)]
pub struct ExportFile {
  target: BuildTarget,
  deps: BTreeSet<BuildTarget>,
  src: ResolvedSourcePath,
  out: PathBuf,
}

impl RuleKeyAppendable for ExportFile {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.set("src", &self.src)?.set("out", &self.out)?;
    Ok(())
  }
}

impl BuildRule for ExportFile {
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
    let dir = gen_dir(&self.target);
    vec![
      Box::new(MakeCleanDirectoryStep::new(dir.clone())),
      Box::new(CopyStep::new(self.src.path(), dir.join(&self.out))),
    ]
  }

  fn outputs(&self) -> Vec<PathBuf> {
    vec![gen_dir(&self.target).join(&self.out)]
  }
}
