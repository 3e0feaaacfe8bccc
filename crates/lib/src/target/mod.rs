//! Build target identities.
//!
//! A target is written `cell//base/path:name#flavor1,flavor2`. The cell is
//! omitted for the root cell, the flavor suffix is optional, and inside a
//! declaration file `:name` refers to a target in the same package.

pub mod pattern;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub use pattern::VisibilityPattern;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid build target '{text}': {reason}")]
pub struct TargetParseError {
  pub text: String,
  pub reason: String,
}

impl TargetParseError {
  fn new(text: &str, reason: impl Into<String>) -> Self {
    Self {
      text: text.to_string(),
      reason: reason.into(),
    }
  }
}

/// A variant tag on a target, such as `test` in `//a:lib#test`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Flavor(String);

impl Flavor {
  pub fn new(name: &str) -> Result<Self, TargetParseError> {
    if name.is_empty() {
      return Err(TargetParseError::new(name, "flavor must not be empty"));
    }
    if let Some(c) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || "-_.".contains(*c))) {
      return Err(TargetParseError::new(name, format!("flavor contains invalid character '{c}'")));
    }
    Ok(Self(name.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Flavor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// The identity of one buildable unit.
///
/// Immutable. Ordering is lexicographic over the fully-qualified form, so
/// sorted collections of targets read the same way they print.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildTarget {
  cell: Option<String>,
  base_path: String,
  short_name: String,
  flavors: BTreeSet<Flavor>,
}

impl BuildTarget {
  /// Build an unflavored target from its parts. `base_path` uses `/` separators.
  pub fn new(cell: Option<&str>, base_path: &str, short_name: &str) -> Result<Self, TargetParseError> {
    let base_path = base_path.trim_matches('/');
    let text = || format!("{}//{}:{}", cell.unwrap_or(""), base_path, short_name);

    if short_name.is_empty() {
      return Err(TargetParseError::new(&text(), "target name must not be empty"));
    }
    if let Some(c) = short_name.chars().find(|c| matches!(c, '/' | ':' | '#' | ',')) {
      return Err(TargetParseError::new(&text(), format!("target name contains '{c}'")));
    }
    if base_path.split('/').any(|seg| seg == ".." || seg == ".") {
      return Err(TargetParseError::new(&text(), "package path must be normalized"));
    }
    if base_path.contains("//") || base_path.contains(':') {
      return Err(TargetParseError::new(&text(), "malformed package path"));
    }
    if let Some(cell) = cell
      && (cell.is_empty() || cell.contains('/'))
    {
      return Err(TargetParseError::new(&text(), "malformed cell name"));
    }

    Ok(Self {
      cell: cell.map(str::to_string),
      base_path: base_path.to_string(),
      short_name: short_name.to_string(),
      flavors: BTreeSet::new(),
    })
  }

  /// Parse a fully-qualified target (`//a:b`, `cell//a:b#f`).
  pub fn parse(text: &str) -> Result<Self, TargetParseError> {
    Self::parse_relative(text, None)
  }

  /// Parse a target that may be written relative to `context` (`:name`).
  pub fn parse_relative(text: &str, context: Option<&BuildTarget>) -> Result<Self, TargetParseError> {
    let (body, flavors) = match text.split_once('#') {
      Some((body, flavors)) => (body, Some(flavors)),
      None => (text, None),
    };

    let mut target = if let Some(name) = body.strip_prefix(':') {
      let context = context.ok_or_else(|| TargetParseError::new(text, "relative target outside of a package"))?;
      Self::new(context.cell(), context.base_path(), name).map_err(|e| TargetParseError::new(text, e.reason))?
    } else {
      let (cell, rest) = body
        .split_once("//")
        .ok_or_else(|| TargetParseError::new(text, "expected '//' before the package path"))?;
      let (base, name) = rest
        .rsplit_once(':')
        .ok_or_else(|| TargetParseError::new(text, "expected ':' before the target name"))?;
      let cell = (!cell.is_empty()).then_some(cell);
      Self::new(cell, base, name).map_err(|e| TargetParseError::new(text, e.reason))?
    };

    if let Some(flavors) = flavors {
      for name in flavors.split(',') {
        target.flavors.insert(Flavor::new(name).map_err(|e| TargetParseError::new(text, e.reason))?);
      }
    }
    Ok(target)
  }

  pub fn cell(&self) -> Option<&str> {
    self.cell.as_deref()
  }

  /// The package path, `/`-separated, empty for the project root.
  pub fn base_path(&self) -> &str {
    &self.base_path
  }

  pub fn base_path_buf(&self) -> PathBuf {
    self.base_path.split('/').filter(|s| !s.is_empty()).collect()
  }

  pub fn short_name(&self) -> &str {
    &self.short_name
  }

  pub fn flavors(&self) -> &BTreeSet<Flavor> {
    &self.flavors
  }

  pub fn is_flavored(&self) -> bool {
    !self.flavors.is_empty()
  }

  /// Same package as `other`, in the same cell.
  pub fn same_package(&self, other: &BuildTarget) -> bool {
    self.cell == other.cell && self.base_path == other.base_path
  }

  /// A copy with `flavors` added to the existing set.
  pub fn with_flavors(&self, flavors: impl IntoIterator<Item = Flavor>) -> Self {
    let mut target = self.clone();
    target.flavors.extend(flavors);
    target
  }

  pub fn unflavored(&self) -> Self {
    Self {
      flavors: BTreeSet::new(),
      ..self.clone()
    }
  }

  pub fn fully_qualified_name(&self) -> String {
    self.to_string()
  }
}

impl fmt::Display for BuildTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}//{}:{}",
      self.cell.as_deref().unwrap_or(""),
      self.base_path,
      self.short_name
    )?;
    if !self.flavors.is_empty() {
      let flavors: Vec<&str> = self.flavors.iter().map(Flavor::as_str).collect();
      write!(f, "#{}", flavors.join(","))?;
    }
    Ok(())
  }
}

impl Ord for BuildTarget {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    self.to_string().cmp(&other.to_string())
  }
}

impl PartialOrd for BuildTarget {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl std::str::FromStr for BuildTarget {
  type Err = TargetParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl Serialize for BuildTarget {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for BuildTarget {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let text = String::deserialize(deserializer)?;
    Self::parse(&text).map_err(serde::de::Error::custom)
  }
}
