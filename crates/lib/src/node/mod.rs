//! Validated target graph vertices.
//!
//! A `TargetNode` is built once per declaration. Construction coerces the raw
//! attributes, discovers dependencies and input paths embedded in them, asks
//! the description for anything it can infer, and enforces package
//! boundaries. Nodes are immutable; flavor or description substitution builds
//! a fresh node from the same raw declaration.

pub mod factory;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::attrs::{AttrTraversal, CoerceError, ConstructorArg};
use crate::build_file_tree::BuildFileTree;
use crate::description::{RegisteredDescription, RuleType};
use crate::parser::RawRuleData;
use crate::target::{BuildTarget, Flavor, TargetParseError, VisibilityPattern};
use crate::util::hash::ContentHash;
use crate::util::paths::{is_under, relativize, to_slash};

pub use factory::TargetNodeFactory;

#[derive(Debug, Error)]
pub enum NodeError {
  #[error(transparent)]
  Target(#[from] TargetParseError),

  #[error(transparent)]
  Coerce(#[from] CoerceError),

  #[error("{target}: unknown rule type '{rule_type}'")]
  UnknownRuleType { target: String, rule_type: String },

  #[error("'{path}' in '{target}' refers to a parent directory.")]
  ParentDirectory { path: String, target: String },

  #[error(
    "'{path}' in '{target}' crosses a package boundary. No package owns it; \
     check whether one of its directories is listed under [project] ignore in kiln.toml."
  )]
  UnownedPath { path: String, target: String },

  #[error(
    "'{path}' in '{target}' crosses a package boundary. This file is owned by '{owner}'. \
     Reference it through a target declared in that package instead."
  )]
  CrossesPackageBoundary {
    path: String,
    target: String,
    owner: String,
  },

  #[error("{dependent} depends on {dependency}, which is not visible")]
  NotVisible { dependent: String, dependency: String },
}

/// Construction settings shared by every node of a project.
#[derive(Debug, Clone)]
pub struct NodeParams {
  pub build_file_tree: Arc<BuildFileTree>,
  pub enforce_package_boundary: bool,
}

impl NodeParams {
  pub fn new(build_file_tree: BuildFileTree, enforce_package_boundary: bool) -> Self {
    Self {
      build_file_tree: Arc::new(build_file_tree),
      enforce_package_boundary,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TargetNode {
  target: BuildTarget,
  description: RegisteredDescription,
  raw: Arc<RawRuleData>,
  arg: ConstructorArg,
  declared_deps: BTreeSet<BuildTarget>,
  extra_deps: BTreeSet<BuildTarget>,
  inputs: BTreeSet<PathBuf>,
  visibility: Vec<VisibilityPattern>,
  params: NodeParams,
}

/// Collects embedded references, checking each input path as it is found.
struct ReferenceCollector<'a> {
  target: &'a BuildTarget,
  params: &'a NodeParams,
  deps: BTreeSet<BuildTarget>,
  inputs: BTreeSet<PathBuf>,
}

impl AttrTraversal for ReferenceCollector<'_> {
  type Error = NodeError;

  fn dep(&mut self, target: &BuildTarget) -> Result<(), NodeError> {
    self.deps.insert(target.clone());
    Ok(())
  }

  fn input(&mut self, path: &Path) -> Result<(), NodeError> {
    if self.params.enforce_package_boundary {
      verify_path(self.target, &self.params.build_file_tree, path)?;
    }
    self.inputs.insert(path.to_path_buf());
    Ok(())
  }
}

fn verify_path(target: &BuildTarget, tree: &BuildFileTree, path: &Path) -> Result<(), NodeError> {
  let base_path = target.base_path_buf();
  if !is_under(path, &base_path) {
    return Err(NodeError::ParentDirectory {
      path: relativize(&base_path, path),
      target: target.to_string(),
    });
  }

  // Ownership is only tracked for the root cell.
  if target.cell().is_some() {
    return Ok(());
  }

  match tree.base_path_of_ancestor_target(path) {
    None => Err(NodeError::UnownedPath {
      path: to_slash(path),
      target: target.to_string(),
    }),
    Some(owner) if owner != base_path => Err(NodeError::CrossesPackageBoundary {
      path: to_slash(path),
      target: target.to_string(),
      owner: format!("//{}", to_slash(owner)),
    }),
    Some(_) => Ok(()),
  }
}

impl TargetNode {
  pub fn new(
    params: NodeParams,
    target: BuildTarget,
    raw: Arc<RawRuleData>,
    description: RegisteredDescription,
    declared_deps: BTreeSet<BuildTarget>,
    visibility: Vec<VisibilityPattern>,
  ) -> Result<Self, NodeError> {
    let arg = description.schema.coerce(&target, &raw)?;

    let mut collector = ReferenceCollector {
      target: &target,
      params: &params,
      deps: BTreeSet::new(),
      inputs: BTreeSet::new(),
    };
    description.schema.traverse(&arg, &mut collector)?;

    collector
      .deps
      .extend(description.description.infer_implicit_deps(&target, &arg)?);
    for path in description.description.infer_implicit_inputs(&target, &arg)? {
      collector.input(&path)?;
    }

    let ReferenceCollector { deps, inputs, .. } = collector;
    let extra_deps: BTreeSet<BuildTarget> = deps.difference(&declared_deps).cloned().collect();

    trace!(
      target = %target,
      declared = declared_deps.len(),
      extra = extra_deps.len(),
      inputs = inputs.len(),
      "constructed target node"
    );

    Ok(Self {
      target,
      description,
      raw,
      arg,
      declared_deps,
      extra_deps,
      inputs,
      visibility,
      params,
    })
  }

  pub fn target(&self) -> &BuildTarget {
    &self.target
  }

  pub fn rule_type(&self) -> RuleType {
    self.description.rule_type()
  }

  pub fn description(&self) -> &RegisteredDescription {
    &self.description
  }

  pub fn constructor_arg(&self) -> &ConstructorArg {
    &self.arg
  }

  pub fn raw(&self) -> &RawRuleData {
    &self.raw
  }

  /// Hash of the raw declaration this node was built from.
  pub fn raw_hash(&self) -> &ContentHash {
    &self.raw.content_hash
  }

  pub fn declared_deps(&self) -> &BTreeSet<BuildTarget> {
    &self.declared_deps
  }

  /// Dependencies discovered in the arguments or inferred, minus declared ones.
  pub fn extra_deps(&self) -> &BTreeSet<BuildTarget> {
    &self.extra_deps
  }

  pub fn deps(&self) -> BTreeSet<BuildTarget> {
    self.declared_deps.union(&self.extra_deps).cloned().collect()
  }

  /// Input files, relative to the cell root.
  pub fn inputs(&self) -> &BTreeSet<PathBuf> {
    &self.inputs
  }

  pub fn visibility(&self) -> &[VisibilityPattern] {
    &self.visibility
  }

  pub fn is_test(&self) -> bool {
    self.description.description.is_test()
  }

  /// Targets in the same package always see each other.
  pub fn is_visible_to(&self, other: &BuildTarget) -> bool {
    self.target.same_package(other) || self.visibility.iter().any(|pattern| pattern.matches(other))
  }

  /// Fails when `dependent` may not depend on this node.
  pub fn check_visibility(&self, dependent: &BuildTarget) -> Result<(), NodeError> {
    if self.is_visible_to(dependent) {
      Ok(())
    } else {
      Err(NodeError::NotVisible {
        dependent: dependent.to_string(),
        dependency: self.target.to_string(),
      })
    }
  }

  /// A sibling node interpreting the same declaration with another description.
  pub fn with_description(&self, description: RegisteredDescription) -> Result<Self, NodeError> {
    Self::new(
      self.params.clone(),
      self.target.clone(),
      self.raw.clone(),
      description,
      self.declared_deps.clone(),
      self.visibility.clone(),
    )
  }

  /// A sibling node for a flavored variant of this target.
  pub fn with_flavors(&self, flavors: impl IntoIterator<Item = Flavor>) -> Result<Self, NodeError> {
    Self::new(
      self.params.clone(),
      self.target.with_flavors(flavors),
      self.raw.clone(),
      self.description.clone(),
      self.declared_deps.clone(),
      self.visibility.clone(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::attrs::{AttrSpec, AttrType, RuleSchema};
  use crate::description::Description;
  use crate::rules::{BuildRule, BuildRuleResolver, RuleError};
  use serde_json::{Value, json};

  #[derive(Debug)]
  struct LibraryDescription;

  #[async_trait::async_trait]
  impl Description for LibraryDescription {
    fn rule_type(&self) -> RuleType {
      RuleType::new("library")
    }

    fn schema(&self) -> RuleSchema {
      RuleSchema::new([
        AttrSpec::new("srcs", AttrType::list(AttrType::SourcePath)).with_default(json!([])),
        AttrSpec::optional("header", AttrType::Path),
        AttrSpec::optional("compiler", AttrType::Target).not_walked(),
      ])
    }

    fn infer_implicit_deps(&self, target: &BuildTarget, _arg: &ConstructorArg) -> Result<BTreeSet<BuildTarget>, CoerceError> {
      let runtime = BuildTarget::parse_relative(":runtime", Some(target)).map_err(|e| CoerceError::InvalidValue {
        target: target.to_string(),
        attribute: "srcs".into(),
        message: e.to_string(),
      })?;
      Ok(BTreeSet::from([runtime]))
    }

    async fn create_build_rule(
      &self,
      _node: &TargetNode,
      _resolver: &BuildRuleResolver,
    ) -> Result<Arc<dyn BuildRule>, RuleError> {
      unreachable!("not materialized in these tests")
    }
  }

  #[derive(Debug)]
  struct OpaqueDescription;

  #[async_trait::async_trait]
  impl Description for OpaqueDescription {
    fn rule_type(&self) -> RuleType {
      RuleType::new("opaque")
    }

    fn schema(&self) -> RuleSchema {
      RuleSchema::new([
        AttrSpec::new("srcs", AttrType::list(AttrType::SourcePath)).not_walked(),
        AttrSpec::optional("header", AttrType::Path).not_walked(),
        AttrSpec::optional("compiler", AttrType::Target).not_walked(),
      ])
    }

    async fn create_build_rule(
      &self,
      _node: &TargetNode,
      _resolver: &BuildRuleResolver,
    ) -> Result<Arc<dyn BuildRule>, RuleError> {
      unreachable!("not materialized in these tests")
    }
  }

  fn raw(base: &str, attrs: Value) -> Arc<RawRuleData> {
    let Value::Object(map) = attrs else { panic!("object") };
    Arc::new(RawRuleData::from_object(None, base, map.into_iter().collect()).unwrap())
  }

  fn params(packages: &[&str]) -> NodeParams {
    NodeParams::new(BuildFileTree::from_base_paths(packages.iter().copied()), true)
  }

  fn node(params: NodeParams, base: &str, attrs: Value, declared: &[&str]) -> Result<TargetNode, NodeError> {
    let raw = raw(base, attrs);
    let target = raw.target().unwrap();
    let declared = declared.iter().map(|d| BuildTarget::parse(d).unwrap()).collect();
    TargetNode::new(
      params,
      target,
      raw,
      RegisteredDescription::new(Arc::new(LibraryDescription)),
      declared,
      vec![],
    )
  }

  #[test]
  fn extra_deps_exclude_declared_deps() {
    let n = node(
      params(&["a"]),
      "a",
      json!({"type": "library", "name": "lib", "srcs": ["x.c", "//b:gen", ":runtime"], "compiler": "//tools:cc"}),
      &["//b:gen"],
    )
    .unwrap();

    let extra: Vec<String> = n.extra_deps().iter().map(ToString::to_string).collect();
    assert_eq!(extra, vec!["//a:runtime"]);
    assert!(n.declared_deps().is_disjoint(n.extra_deps()));
    assert_eq!(n.deps().len(), 2);
    assert_eq!(n.inputs().iter().collect::<Vec<_>>(), vec![Path::new("a/x.c")]);
  }

  #[test]
  fn input_in_parent_directory_fails() {
    let err = node(
      params(&["a/lib", "other"]),
      "a/lib",
      json!({"type": "library", "name": "lib", "srcs": ["../../other/b.txt"]}),
      &[],
    )
    .unwrap_err();
    assert_eq!(
      err.to_string(),
      "'../../other/b.txt' in '//a/lib:lib' refers to a parent directory."
    );
  }

  #[test]
  fn input_owned_by_subpackage_names_the_owner() {
    let err = node(
      params(&["a", "a/sub"]),
      "a",
      json!({"type": "library", "name": "lib", "header": "sub/x.h"}),
      &[],
    )
    .unwrap_err();
    assert!(matches!(&err, NodeError::CrossesPackageBoundary { owner, .. } if owner == "//a/sub"));
    assert!(err.to_string().contains("'a/sub/x.h' in '//a:lib'"));
  }

  #[test]
  fn input_in_same_package_succeeds() {
    let n = node(
      params(&["a"]),
      "a",
      json!({"type": "library", "name": "lib", "srcs": ["deep/dir/x.c"]}),
      &[],
    )
    .unwrap();
    assert!(n.inputs().contains(Path::new("a/deep/dir/x.c")));
  }

  #[test]
  fn boundary_enforcement_can_be_disabled() {
    let params = NodeParams::new(BuildFileTree::from_base_paths(["a", "a/sub"]), false);
    let n = node(params, "a", json!({"type": "library", "name": "lib", "header": "sub/x.h"}), &[]).unwrap();
    assert!(n.inputs().contains(Path::new("a/sub/x.h")));
  }

  #[test]
  fn visibility_follows_package_and_patterns() {
    let raw = raw("a", json!({"type": "library", "name": "lib"}));
    let target = raw.target().unwrap();
    let n = TargetNode::new(
      params(&["a"]),
      target.clone(),
      raw,
      RegisteredDescription::new(Arc::new(LibraryDescription)),
      BTreeSet::new(),
      vec![VisibilityPattern::parse("//friends/...", None).unwrap()],
    )
    .unwrap();

    assert!(n.is_visible_to(&BuildTarget::parse("//a:other").unwrap()));
    assert!(n.is_visible_to(&BuildTarget::parse("//friends/x:y").unwrap()));
    let err = n.check_visibility(&BuildTarget::parse("//stranger:z").unwrap()).unwrap_err();
    assert_eq!(err.to_string(), "//stranger:z depends on //a:lib, which is not visible");
  }

  #[test]
  fn substitutions_produce_revalidated_siblings() {
    let n = node(
      params(&["a"]),
      "a",
      json!({"type": "library", "name": "lib", "srcs": ["x.c", "//b:gen"]}),
      &[],
    )
    .unwrap();

    let flavored = n.with_flavors([Flavor::new("test").unwrap()]).unwrap();
    assert_eq!(flavored.target().to_string(), "//a:lib#test");
    assert_eq!(flavored.extra_deps(), n.extra_deps());
    assert_eq!(n.target().to_string(), "//a:lib");

    let opaque = n
      .with_description(RegisteredDescription::new(Arc::new(OpaqueDescription)))
      .unwrap();
    assert!(opaque.extra_deps().is_empty());
    assert!(opaque.inputs().is_empty());
    assert_eq!(opaque.raw_hash(), n.raw_hash());
  }
}
