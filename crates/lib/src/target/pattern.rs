//! Visibility patterns.
//!
//! - `PUBLIC` matches every target
//! - `//a:b` matches exactly that target (flavors ignored)
//! - `//a:` matches any target in package `a`
//! - `//a/...` matches package `a` and every package beneath it

use std::fmt;

use super::{BuildTarget, TargetParseError};
use crate::consts::VISIBILITY_PUBLIC;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VisibilityPattern {
  Public,
  Target(BuildTarget),
  Package { cell: Option<String>, base_path: String },
  Recursive { cell: Option<String>, base_path: String },
}

impl VisibilityPattern {
  /// Parse a pattern, resolving `:name` against the declaring target.
  pub fn parse(text: &str, context: Option<&BuildTarget>) -> Result<Self, TargetParseError> {
    if text == VISIBILITY_PUBLIC {
      return Ok(VisibilityPattern::Public);
    }

    let invalid = |reason: &str| TargetParseError {
      text: text.to_string(),
      reason: reason.to_string(),
    };

    if let Some(prefix) = text.strip_suffix("...") {
      let (cell, base) = split_cell(prefix).ok_or_else(|| invalid("expected '//' before the package path"))?;
      let base = base.trim_end_matches('/');
      if base.contains(':') {
        return Err(invalid("recursive pattern must not name a target"));
      }
      return Ok(VisibilityPattern::Recursive {
        cell,
        base_path: base.to_string(),
      });
    }

    if let Some(prefix) = text.strip_suffix(':') {
      let (cell, base) = split_cell(prefix).ok_or_else(|| invalid("expected '//' before the package path"))?;
      return Ok(VisibilityPattern::Package {
        cell,
        base_path: base.trim_matches('/').to_string(),
      });
    }

    Ok(VisibilityPattern::Target(BuildTarget::parse_relative(text, context)?.unflavored()))
  }

  pub fn matches(&self, target: &BuildTarget) -> bool {
    match self {
      VisibilityPattern::Public => true,
      VisibilityPattern::Target(expected) => *expected == target.unflavored(),
      VisibilityPattern::Package { cell, base_path } => {
        cell.as_deref() == target.cell() && base_path == target.base_path()
      }
      VisibilityPattern::Recursive { cell, base_path } => {
        cell.as_deref() == target.cell()
          && (base_path.is_empty()
            || target.base_path() == base_path
            || target
              .base_path()
              .strip_prefix(base_path.as_str())
              .is_some_and(|rest| rest.starts_with('/')))
      }
    }
  }
}

fn split_cell(text: &str) -> Option<(Option<String>, &str)> {
  let (cell, rest) = text.split_once("//")?;
  Some(((!cell.is_empty()).then(|| cell.to_string()), rest))
}

impl fmt::Display for VisibilityPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      VisibilityPattern::Public => f.write_str(VISIBILITY_PUBLIC),
      VisibilityPattern::Target(target) => write!(f, "{target}"),
      VisibilityPattern::Package { cell, base_path } => {
        write!(f, "{}//{}:", cell.as_deref().unwrap_or(""), base_path)
      }
      VisibilityPattern::Recursive { cell, base_path } if base_path.is_empty() => {
        write!(f, "{}//...", cell.as_deref().unwrap_or(""))
      }
      VisibilityPattern::Recursive { cell, base_path } => {
        write!(f, "{}//{}/...", cell.as_deref().unwrap_or(""), base_path)
      }
    }
  }
}
