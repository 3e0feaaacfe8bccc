use std::path::Path;

use super::{AttrValue, ConstructorArg, RuleSchema, SourcePath};
use crate::target::BuildTarget;

/// Visitor over the target references and input paths embedded in attributes.
///
/// The first error aborts the walk and is returned to the caller.
pub trait AttrTraversal {
  type Error;

  fn dep(&mut self, target: &BuildTarget) -> Result<(), Self::Error>;

  fn input(&mut self, _path: &Path) -> Result<(), Self::Error> {
    Ok(())
  }
}

impl AttrValue {
  pub fn traverse<T: AttrTraversal + ?Sized>(&self, traversal: &mut T) -> Result<(), T::Error> {
    match self {
      AttrValue::None | AttrValue::String(_) | AttrValue::Int(_) | AttrValue::Bool(_) => Ok(()),
      AttrValue::Target(target) | AttrValue::SourcePath(SourcePath::Target(target)) => traversal.dep(target),
      AttrValue::SourcePath(SourcePath::Path(path)) | AttrValue::Path(path) => traversal.input(path),
      AttrValue::List(items) => items.iter().try_for_each(|item| item.traverse(traversal)),
      AttrValue::Dict(map) => map.values().try_for_each(|item| item.traverse(traversal)),
    }
  }
}

impl RuleSchema {
  /// Walk every attribute flagged as both dependency- and input-bearing.
  pub fn traverse<T: AttrTraversal + ?Sized>(&self, arg: &ConstructorArg, traversal: &mut T) -> Result<(), T::Error> {
    for spec in self.attrs().filter(|spec| spec.is_walked()) {
      if let Some(value) = arg.get(&spec.name) {
        value.traverse(traversal)?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::attrs::{AttrSpec, AttrType};
  use crate::parser::RawRuleData;
  use serde_json::json;
  use std::path::PathBuf;

  #[derive(Default)]
  struct Collect {
    deps: Vec<String>,
    inputs: Vec<PathBuf>,
  }

  impl AttrTraversal for Collect {
    type Error = String;

    fn dep(&mut self, target: &BuildTarget) -> Result<(), String> {
      if target.short_name() == "forbidden" {
        return Err(format!("refused {target}"));
      }
      self.deps.push(target.to_string());
      Ok(())
    }

    fn input(&mut self, path: &Path) -> Result<(), String> {
      self.inputs.push(path.to_path_buf());
      Ok(())
    }
  }

  fn arg(schema: &RuleSchema, attrs: serde_json::Value) -> ConstructorArg {
    let serde_json::Value::Object(map) = attrs else { panic!() };
    let raw = RawRuleData::from_object(None, "p", map.into_iter().collect()).unwrap();
    schema.coerce(&raw.target().unwrap(), &raw).unwrap()
  }

  #[test]
  fn walks_only_flagged_attributes() {
    let schema = RuleSchema::new([
      AttrSpec::new("srcs", AttrType::list(AttrType::SourcePath)),
      AttrSpec::new("tool", AttrType::Target).not_walked(),
      AttrSpec {
        input: false,
        ..AttrSpec::new("label", AttrType::Target)
      },
    ]);
    let arg = arg(
      &schema,
      json!({"type": "t", "name": "x", "srcs": ["a.c", ":gen"], "tool": ":cc", "label": ":l", "deps": [":d"]}),
    );

    let mut collect = Collect::default();
    schema.traverse(&arg, &mut collect).unwrap();
    assert_eq!(collect.deps, vec!["//p:gen"]);
    assert_eq!(collect.inputs, vec![PathBuf::from("p/a.c")]);
  }

  #[test]
  fn first_error_aborts() {
    let schema = RuleSchema::new([AttrSpec::new("srcs", AttrType::list(AttrType::SourcePath))]);
    let arg = arg(&schema, json!({"type": "t", "name": "x", "srcs": [":forbidden", "late.c"]}));

    let mut collect = Collect::default();
    assert_eq!(schema.traverse(&arg, &mut collect), Err("refused //p:forbidden".to_string()));
    assert!(collect.inputs.is_empty());
  }
}
