use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use super::{AttrType, AttrValue, CoerceError, SourcePath};
use crate::parser::{ATTR_DEPS, ATTR_NAME, ATTR_TYPE, ATTR_VISIBILITY, RawRuleData};
use crate::target::BuildTarget;

/// One declared attribute of a rule type.
#[derive(Debug, Clone)]
pub struct AttrSpec {
  pub name: String,
  pub ty: AttrType,
  /// Value used when the declaration omits the attribute. `None` means required.
  pub default: Option<Value>,
  /// The attribute may hold dependency references.
  pub dep: bool,
  /// The attribute may hold input paths.
  pub input: bool,
}

impl AttrSpec {
  /// A required attribute that participates in dependency and input discovery.
  pub fn new(name: &str, ty: AttrType) -> Self {
    Self {
      name: name.to_string(),
      ty,
      default: None,
      dep: true,
      input: true,
    }
  }

  pub fn with_default(mut self, default: Value) -> Self {
    self.default = Some(default);
    self
  }

  /// Optional attribute; an omitted value coerces to `AttrValue::None`.
  pub fn optional(name: &str, ty: AttrType) -> Self {
    Self::new(name, AttrType::optional(ty)).with_default(Value::Null)
  }

  /// Exclude the attribute from dependency and input discovery.
  pub fn not_walked(mut self) -> Self {
    self.dep = false;
    self.input = false;
    self
  }

  /// Walked only when flagged both as dependency-bearing and input-bearing.
  pub fn is_walked(&self) -> bool {
    self.dep && self.input
  }
}

/// The argument shape of one rule type. Built once per type and shared.
#[derive(Debug, Clone)]
pub struct RuleSchema {
  attrs: BTreeMap<String, AttrSpec>,
}

impl RuleSchema {
  /// A schema with the implicit `deps` attribute. Declared dependencies are
  /// handled by node construction, so `deps` is not walked.
  pub fn new(attrs: impl IntoIterator<Item = AttrSpec>) -> Self {
    let deps = AttrSpec::new(ATTR_DEPS, AttrType::list(AttrType::Target))
      .with_default(Value::Array(Vec::new()))
      .not_walked();
    let attrs = std::iter::once(deps)
      .chain(attrs)
      .map(|spec| (spec.name.clone(), spec))
      .collect();
    Self { attrs }
  }

  pub fn attr(&self, name: &str) -> Option<&AttrSpec> {
    self.attrs.get(name)
  }

  pub fn attrs(&self) -> impl Iterator<Item = &AttrSpec> {
    self.attrs.values()
  }

  /// Coerce a raw declaration into typed arguments.
  pub fn coerce(&self, target: &BuildTarget, raw: &RawRuleData) -> Result<ConstructorArg, CoerceError> {
    if let Some(unknown) = raw
      .attributes
      .keys()
      .find(|key| !matches!(key.as_str(), ATTR_NAME | ATTR_TYPE | ATTR_VISIBILITY) && !self.attrs.contains_key(*key))
    {
      return Err(CoerceError::UnknownAttribute {
        target: target.to_string(),
        attribute: unknown.clone(),
      });
    }

    let mut values = BTreeMap::new();
    for spec in self.attrs.values() {
      let raw_value = match (raw.get(&spec.name), &spec.default) {
        (Some(value), _) => value,
        (None, Some(default)) => default,
        (None, None) => {
          return Err(CoerceError::MissingAttribute {
            target: target.to_string(),
            attribute: spec.name.clone(),
          });
        }
      };
      values.insert(spec.name.clone(), spec.ty.coerce(target, &spec.name, raw_value)?);
    }
    Ok(ConstructorArg { values })
  }
}

/// Coerced arguments of one target, keyed by attribute name.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstructorArg {
  values: BTreeMap<String, AttrValue>,
}

impl ConstructorArg {
  pub fn get(&self, name: &str) -> Option<&AttrValue> {
    self.values.get(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
    self.values.iter().map(|(k, v)| (k.as_str(), v))
  }

  pub fn string(&self, name: &str) -> Option<&str> {
    self.get(name).and_then(AttrValue::as_str)
  }

  pub fn bool_or(&self, name: &str, fallback: bool) -> bool {
    self.get(name).and_then(AttrValue::as_bool).unwrap_or(fallback)
  }

  pub fn strings(&self, name: &str) -> Vec<String> {
    self
      .get(name)
      .map(|v| v.as_list().iter().filter_map(AttrValue::as_str).map(str::to_string).collect())
      .unwrap_or_default()
  }

  pub fn source_path(&self, name: &str) -> Option<&SourcePath> {
    self.get(name).and_then(AttrValue::as_source_path)
  }

  pub fn source_paths(&self, name: &str) -> Vec<SourcePath> {
    self
      .get(name)
      .map(|v| v.as_list().iter().filter_map(AttrValue::as_source_path).cloned().collect())
      .unwrap_or_default()
  }

  pub fn path(&self, name: &str) -> Option<&PathBuf> {
    match self.get(name) {
      Some(AttrValue::Path(p)) => Some(p),
      _ => None,
    }
  }

  pub fn string_map(&self, name: &str) -> BTreeMap<String, String> {
    match self.get(name) {
      Some(AttrValue::Dict(map)) => map
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect(),
      _ => BTreeMap::new(),
    }
  }
}
