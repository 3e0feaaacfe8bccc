use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use super::{NodeError, NodeParams, TargetNode};
use crate::attrs::CoerceError;
use crate::description::DescriptionRegistry;
use crate::parser::{ATTR_DEPS, ATTR_VISIBILITY, RawRuleData};
use crate::target::{BuildTarget, VisibilityPattern};

/// Turns raw declarations into validated nodes.
#[derive(Debug, Clone)]
pub struct TargetNodeFactory {
  registry: Arc<DescriptionRegistry>,
  params: NodeParams,
}

impl TargetNodeFactory {
  pub fn new(registry: Arc<DescriptionRegistry>, params: NodeParams) -> Self {
    Self { registry, params }
  }

  pub fn create_node(&self, raw: RawRuleData) -> Result<TargetNode, NodeError> {
    let target = raw.target()?;
    let description = self
      .registry
      .get(&raw.rule_type)
      .cloned()
      .ok_or_else(|| NodeError::UnknownRuleType {
        target: target.to_string(),
        rule_type: raw.rule_type.clone(),
      })?;

    let declared_deps = string_list(&target, &raw, ATTR_DEPS)?
      .iter()
      .map(|dep| BuildTarget::parse_relative(dep, Some(&target)))
      .collect::<Result<BTreeSet<_>, _>>()?;

    let visibility = string_list(&target, &raw, ATTR_VISIBILITY)?
      .iter()
      .map(|pattern| VisibilityPattern::parse(pattern, Some(&target)))
      .collect::<Result<Vec<_>, _>>()?;

    TargetNode::new(self.params.clone(), target, Arc::new(raw), description, declared_deps, visibility)
  }
}

fn string_list<'a>(target: &BuildTarget, raw: &'a RawRuleData, attribute: &str) -> Result<Vec<&'a str>, CoerceError> {
  let mismatch = |found: &str| CoerceError::TypeMismatch {
    target: target.to_string(),
    attribute: attribute.to_string(),
    expected: "list of string".to_string(),
    found: found.to_string(),
  };
  match raw.get(attribute) {
    None | Some(Value::Null) => Ok(Vec::new()),
    Some(Value::Array(items)) => items
      .iter()
      .map(|item| item.as_str().ok_or_else(|| mismatch("list containing a non-string")))
      .collect(),
    Some(_) => Err(mismatch("a non-list value")),
  }
}
