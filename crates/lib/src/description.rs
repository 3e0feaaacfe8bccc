//! Rule-type descriptors.
//!
//! A `Description` tells the engine how to read one rule type: its argument
//! schema, which extra dependencies and inputs the arguments imply, and how
//! to turn a validated node into an executable `BuildRule`. Schemas are built
//! once at registration and shared by every node of that type.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::attrs::{CoerceError, ConstructorArg, RuleSchema};
use crate::node::TargetNode;
use crate::rules::{BuildRule, BuildRuleResolver, RuleError};
use crate::target::BuildTarget;

/// The name a declaration uses to pick its rule type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleType(String);

impl RuleType {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RuleType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[async_trait]
pub trait Description: Send + Sync + fmt::Debug {
  fn rule_type(&self) -> RuleType;

  fn schema(&self) -> RuleSchema;

  /// Dependencies implied by the arguments beyond the ones they name directly.
  fn infer_implicit_deps(&self, _target: &BuildTarget, _arg: &ConstructorArg) -> Result<BTreeSet<BuildTarget>, CoerceError> {
    Ok(BTreeSet::new())
  }

  /// Input paths implied by the arguments, relative to the cell root.
  fn infer_implicit_inputs(&self, _target: &BuildTarget, _arg: &ConstructorArg) -> Result<BTreeSet<PathBuf>, CoerceError> {
    Ok(BTreeSet::new())
  }

  fn is_test(&self) -> bool {
    false
  }

  /// Materialize a node. Every dependency of the node is already in `resolver`.
  async fn create_build_rule(
    &self,
    node: &TargetNode,
    resolver: &BuildRuleResolver,
  ) -> Result<Arc<dyn BuildRule>, RuleError>;
}

/// A description paired with its schema, as stored in the registry.
#[derive(Debug, Clone)]
pub struct RegisteredDescription {
  pub description: Arc<dyn Description>,
  pub schema: Arc<RuleSchema>,
}

impl RegisteredDescription {
  pub fn new(description: Arc<dyn Description>) -> Self {
    let schema = Arc::new(description.schema());
    Self { description, schema }
  }

  pub fn rule_type(&self) -> RuleType {
    self.description.rule_type()
  }
}

#[derive(Debug, Default)]
pub struct DescriptionRegistry {
  by_type: HashMap<RuleType, RegisteredDescription>,
}

impl DescriptionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// The rule types shipped with the engine.
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register(Arc::new(crate::rules::export_file::ExportFileDescription));
    registry.register(Arc::new(crate::rules::genrule::GenruleDescription));
    registry.register(Arc::new(crate::rules::test::ToolTestDescription));
    registry
  }

  /// Register a description, replacing any previous one of the same type.
  pub fn register(&mut self, description: Arc<dyn Description>) {
    let registered = RegisteredDescription::new(description);
    self.by_type.insert(registered.rule_type(), registered);
  }

  pub fn get(&self, rule_type: &str) -> Option<&RegisteredDescription> {
    self.by_type.get(&RuleType::new(rule_type))
  }

  pub fn rule_types(&self) -> BTreeSet<&RuleType> {
    self.by_type.keys().collect()
  }
}
