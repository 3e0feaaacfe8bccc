//! Declaration file parsing.
//!
//! The engine only needs one `RawRuleData` per target. `BuildFileParser` is
//! the seam; `JsonBuildFileParser` reads a package's declaration file as a
//! JSON array of objects, each naming its rule `type` and target `name`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::target::{BuildTarget, TargetParseError};
use crate::util::hash::{ContentHash, hash_bytes};
use crate::util::paths::to_slash;

/// Attribute holding the rule type.
pub const ATTR_TYPE: &str = "type";
/// Attribute holding the target's short name.
pub const ATTR_NAME: &str = "name";
/// Attribute holding explicitly declared dependencies.
pub const ATTR_DEPS: &str = "deps";
/// Attribute holding visibility patterns.
pub const ATTR_VISIBILITY: &str = "visibility";

#[derive(Debug, Error)]
pub enum ParseError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{path} is not valid JSON: {source}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("{path}: expected a JSON array of rule declarations")]
  NotAnArray { path: PathBuf },

  #[error("{path}: declaration #{index}: {message}")]
  Entry {
    path: PathBuf,
    index: usize,
    message: String,
  },

  #[error("{path}: target '{name}' is declared more than once")]
  DuplicateName { path: PathBuf, name: String },
}

/// The loosely-typed declaration of exactly one target.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRuleData {
  pub cell: Option<String>,
  /// Package path, `/`-separated.
  pub base_path: String,
  pub rule_type: String,
  pub name: String,
  /// Every attribute of the declaration, reserved ones included.
  pub attributes: BTreeMap<String, Value>,
  /// Hash of the canonical bytes of this declaration.
  pub content_hash: ContentHash,
}

impl RawRuleData {
  /// Build raw data from one declaration object.
  pub fn from_object(
    cell: Option<&str>,
    base_path: &str,
    attributes: BTreeMap<String, Value>,
  ) -> Result<Self, String> {
    let field = |key: &str| match attributes.get(key) {
      Some(Value::String(s)) => Ok(s.clone()),
      Some(_) => Err(format!("'{key}' must be a string")),
      None => Err(format!("missing '{key}'")),
    };
    let rule_type = field(ATTR_TYPE)?;
    let name = field(ATTR_NAME)?;

    let canonical = serde_json::to_vec(&attributes).map_err(|e| e.to_string())?;
    Ok(Self {
      cell: cell.map(str::to_string),
      base_path: base_path.to_string(),
      rule_type,
      name,
      content_hash: hash_bytes(&canonical),
      attributes,
    })
  }

  pub fn target(&self) -> Result<BuildTarget, TargetParseError> {
    BuildTarget::new(self.cell.as_deref(), &self.base_path, &self.name)
  }

  pub fn get(&self, attribute: &str) -> Option<&Value> {
    self.attributes.get(attribute)
  }
}

pub trait BuildFileParser: Send + Sync {
  /// Name of the declaration file this parser reads.
  fn build_file_name(&self) -> &str;

  /// Parse the declaration file of the package at `base_path` within a cell.
  fn parse_build_file(
    &self,
    cell: Option<&str>,
    cell_root: &Path,
    base_path: &Path,
  ) -> Result<Vec<RawRuleData>, ParseError>;
}

#[derive(Debug, Clone)]
pub struct JsonBuildFileParser {
  build_file_name: String,
}

impl JsonBuildFileParser {
  pub fn new(build_file_name: impl Into<String>) -> Self {
    Self {
      build_file_name: build_file_name.into(),
    }
  }

  /// Parse declaration text. `path` is used for diagnostics only.
  pub fn parse_str(
    &self,
    text: &str,
    path: &Path,
    cell: Option<&str>,
    base_path: &str,
  ) -> Result<Vec<RawRuleData>, ParseError> {
    let value: Value = serde_json::from_str(text).map_err(|source| ParseError::Json {
      path: path.to_path_buf(),
      source,
    })?;
    let Value::Array(entries) = value else {
      return Err(ParseError::NotAnArray { path: path.to_path_buf() });
    };

    let mut seen = BTreeSet::new();
    let mut rules = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
      let Value::Object(object) = entry else {
        return Err(ParseError::Entry {
          path: path.to_path_buf(),
          index,
          message: "expected an object".to_string(),
        });
      };
      let attributes: BTreeMap<String, Value> = object.into_iter().collect();
      let raw = RawRuleData::from_object(cell, base_path, attributes).map_err(|message| ParseError::Entry {
        path: path.to_path_buf(),
        index,
        message,
      })?;
      if !seen.insert(raw.name.clone()) {
        return Err(ParseError::DuplicateName {
          path: path.to_path_buf(),
          name: raw.name,
        });
      }
      rules.push(raw);
    }
    Ok(rules)
  }
}

impl BuildFileParser for JsonBuildFileParser {
  fn build_file_name(&self) -> &str {
    &self.build_file_name
  }

  fn parse_build_file(
    &self,
    cell: Option<&str>,
    cell_root: &Path,
    base_path: &Path,
  ) -> Result<Vec<RawRuleData>, ParseError> {
    let path = cell_root.join(base_path).join(&self.build_file_name);
    debug!(path = ?path, "parsing build file");
    let text = std::fs::read_to_string(&path).map_err(|source| ParseError::Read {
      path: path.clone(),
      source,
    })?;
    self.parse_str(&text, &path, cell, &to_slash(base_path))
  }
}
