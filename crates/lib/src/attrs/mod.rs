//! Typed rule attributes.
//!
//! Raw declarations carry loosely-typed JSON. Each rule type describes its
//! arguments with a `RuleSchema`; coercion turns raw JSON into `AttrValue`
//! trees whose target references and paths are already resolved against the
//! declaring package.

pub mod schema;
pub mod traversal;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::target::BuildTarget;
use crate::util::paths::{normalize_relative, to_slash};

pub use schema::{AttrSpec, ConstructorArg, RuleSchema};
pub use traversal::AttrTraversal;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoerceError {
  #[error("{target}: unknown attribute '{attribute}'")]
  UnknownAttribute { target: String, attribute: String },

  #[error("{target}: missing required attribute '{attribute}'")]
  MissingAttribute { target: String, attribute: String },

  #[error("{target}: attribute '{attribute}': expected {expected}, got {found}")]
  TypeMismatch {
    target: String,
    attribute: String,
    expected: String,
    found: String,
  },

  #[error("{target}: attribute '{attribute}': {message}")]
  InvalidValue {
    target: String,
    attribute: String,
    message: String,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrType {
  String,
  Int,
  Bool,
  /// A reference to another target.
  Target,
  /// A file in the package, or the output of another target.
  SourcePath,
  /// A package-relative file path.
  Path,
  List(Box<AttrType>),
  /// String-keyed map.
  Dict(Box<AttrType>),
  Optional(Box<AttrType>),
}

impl AttrType {
  pub fn list(inner: AttrType) -> Self {
    AttrType::List(Box::new(inner))
  }

  pub fn dict(inner: AttrType) -> Self {
    AttrType::Dict(Box::new(inner))
  }

  pub fn optional(inner: AttrType) -> Self {
    AttrType::Optional(Box::new(inner))
  }

  /// Coerce `value` for attribute `attribute` of `target`.
  pub fn coerce(&self, target: &BuildTarget, attribute: &str, value: &Value) -> Result<AttrValue, CoerceError> {
    let mismatch = || CoerceError::TypeMismatch {
      target: target.to_string(),
      attribute: attribute.to_string(),
      expected: self.to_string(),
      found: json_kind(value).to_string(),
    };
    let invalid = |message: String| CoerceError::InvalidValue {
      target: target.to_string(),
      attribute: attribute.to_string(),
      message,
    };

    match (self, value) {
      (AttrType::Optional(_), Value::Null) => Ok(AttrValue::None),
      (AttrType::Optional(inner), other) => inner.coerce(target, attribute, other),
      (AttrType::String, Value::String(s)) => Ok(AttrValue::String(s.clone())),
      (AttrType::Int, Value::Number(n)) => n.as_i64().map(AttrValue::Int).ok_or_else(mismatch),
      (AttrType::Bool, Value::Bool(b)) => Ok(AttrValue::Bool(*b)),
      (AttrType::Target, Value::String(s)) => BuildTarget::parse_relative(s, Some(target))
        .map(AttrValue::Target)
        .map_err(|e| invalid(e.to_string())),
      (AttrType::SourcePath, Value::String(s)) if looks_like_target(s) => BuildTarget::parse_relative(s, Some(target))
        .map(|t| AttrValue::SourcePath(SourcePath::Target(t)))
        .map_err(|e| invalid(e.to_string())),
      (AttrType::SourcePath, Value::String(s)) => {
        resolve_path(target, s).map(|p| AttrValue::SourcePath(SourcePath::Path(p))).map_err(invalid)
      }
      (AttrType::Path, Value::String(s)) => resolve_path(target, s).map(AttrValue::Path).map_err(invalid),
      (AttrType::List(inner), Value::Array(items)) => items
        .iter()
        .map(|item| inner.coerce(target, attribute, item))
        .collect::<Result<Vec<_>, _>>()
        .map(AttrValue::List),
      (AttrType::Dict(inner), Value::Object(map)) => map
        .iter()
        .map(|(k, v)| Ok((k.clone(), inner.coerce(target, attribute, v)?)))
        .collect::<Result<BTreeMap<_, _>, _>>()
        .map(AttrValue::Dict),
      _ => Err(mismatch()),
    }
  }
}

impl fmt::Display for AttrType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AttrType::String => f.write_str("string"),
      AttrType::Int => f.write_str("int"),
      AttrType::Bool => f.write_str("bool"),
      AttrType::Target => f.write_str("target"),
      AttrType::SourcePath => f.write_str("source path"),
      AttrType::Path => f.write_str("path"),
      AttrType::List(inner) => write!(f, "list of {inner}"),
      AttrType::Dict(inner) => write!(f, "dict of {inner}"),
      AttrType::Optional(inner) => write!(f, "optional {inner}"),
    }
  }
}

fn json_kind(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "bool",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "list",
    Value::Object(_) => "dict",
  }
}

fn looks_like_target(s: &str) -> bool {
  s.starts_with(':') || s.contains("//")
}

fn resolve_path(target: &BuildTarget, raw: &str) -> Result<PathBuf, String> {
  if raw.is_empty() {
    return Err("path must not be empty".to_string());
  }
  normalize_relative(&target.base_path_buf(), Path::new(raw))
    .ok_or_else(|| format!("path '{raw}' escapes the project root"))
}

/// A file argument: a checked-in file or another target's output.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourcePath {
  /// Relative to the cell root of the declaring target.
  Path(PathBuf),
  Target(BuildTarget),
}

impl fmt::Display for SourcePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SourcePath::Path(path) => f.write_str(&to_slash(path)),
      SourcePath::Target(target) => write!(f, "{target}"),
    }
  }
}

/// A coerced attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
  None,
  String(String),
  Int(i64),
  Bool(bool),
  Target(BuildTarget),
  SourcePath(SourcePath),
  Path(PathBuf),
  List(Vec<AttrValue>),
  Dict(BTreeMap<String, AttrValue>),
}

impl AttrValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      AttrValue::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      AttrValue::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      AttrValue::Int(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_source_path(&self) -> Option<&SourcePath> {
    match self {
      AttrValue::SourcePath(p) => Some(p),
      _ => None,
    }
  }

  pub fn as_list(&self) -> &[AttrValue] {
    match self {
      AttrValue::List(items) => items,
      _ => &[],
    }
  }

  pub fn is_none(&self) -> bool {
    matches!(self, AttrValue::None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn owner() -> BuildTarget {
    BuildTarget::parse("//a/lib:core").unwrap()
  }

  #[test]
  fn coerces_scalars() {
    let t = owner();
    assert_eq!(AttrType::String.coerce(&t, "x", &json!("hi")).unwrap(), AttrValue::String("hi".into()));
    assert_eq!(AttrType::Int.coerce(&t, "x", &json!(3)).unwrap(), AttrValue::Int(3));
    assert_eq!(AttrType::Bool.coerce(&t, "x", &json!(true)).unwrap(), AttrValue::Bool(true));
  }

  #[test]
  fn type_mismatch_names_target_and_attribute() {
    let err = AttrType::list(AttrType::String).coerce(&owner(), "srcs", &json!("x")).unwrap_err();
    assert_eq!(
      err.to_string(),
      "//a/lib:core: attribute 'srcs': expected list of string, got string"
    );
  }

  #[test]
  fn source_paths_resolve_against_package() {
    let t = owner();
    let ty = AttrType::list(AttrType::SourcePath);
    let value = ty.coerce(&t, "srcs", &json!(["main.c", ":gen", "//b:lib", "../x.h"])).unwrap();
    assert_eq!(
      value,
      AttrValue::List(vec![
        AttrValue::SourcePath(SourcePath::Path(PathBuf::from("a/lib/main.c"))),
        AttrValue::SourcePath(SourcePath::Target(BuildTarget::parse("//a/lib:gen").unwrap())),
        AttrValue::SourcePath(SourcePath::Target(BuildTarget::parse("//b:lib").unwrap())),
        AttrValue::SourcePath(SourcePath::Path(PathBuf::from("a/x.h"))),
      ])
    );
  }

  #[test]
  fn paths_may_not_escape_root() {
    let err = AttrType::Path.coerce(&owner(), "src", &json!("../../../etc/passwd")).unwrap_err();
    assert!(matches!(err, CoerceError::InvalidValue { .. }));
    assert!(err.to_string().contains("escapes the project root"));
  }

  #[test]
  fn optional_accepts_null() {
    let ty = AttrType::optional(AttrType::Target);
    assert!(ty.coerce(&owner(), "dep", &json!(null)).unwrap().is_none());
    assert_eq!(
      ty.coerce(&owner(), "dep", &json!(":x")).unwrap(),
      AttrValue::Target(BuildTarget::parse("//a/lib:x").unwrap())
    );
  }

  #[test]
  fn dicts_keep_sorted_keys() {
    let ty = AttrType::dict(AttrType::String);
    let value = ty.coerce(&owner(), "env", &json!({"B": "2", "A": "1"})).unwrap();
    let AttrValue::Dict(map) = value else { panic!("expected dict") };
    assert_eq!(map.keys().collect::<Vec<_>>(), vec!["A", "B"]);
  }
}
