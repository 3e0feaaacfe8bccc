//! Cell roots.
//!
//! A cell is a named project root. Targets carry the cell *name*; this map
//! resolves the name to a directory. The unnamed cell is the project itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::target::BuildTarget;

#[derive(Debug, Error)]
#[error("unknown cell '{name}' (known cells: {known})")]
pub struct UnknownCellError {
  pub name: String,
  pub known: String,
}

#[derive(Debug, Clone)]
pub struct CellRoots {
  root: PathBuf,
  named: BTreeMap<String, PathBuf>,
}

impl CellRoots {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      named: BTreeMap::new(),
    }
  }

  /// Register a named cell. Relative paths resolve against the root cell.
  pub fn with_cell(mut self, name: &str, path: impl AsRef<Path>) -> Self {
    let path = self.root.join(path);
    self.named.insert(name.to_string(), dunce::canonicalize(&path).unwrap_or(path));
    self
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn root_of(&self, cell: Option<&str>) -> Result<&Path, UnknownCellError> {
    match cell {
      None => Ok(&self.root),
      Some(name) => self.named.get(name).map(PathBuf::as_path).ok_or_else(|| UnknownCellError {
        name: name.to_string(),
        known: self.named.keys().cloned().collect::<Vec<_>>().join(", "),
      }),
    }
  }

  /// Filesystem directory of the target's package.
  pub fn package_dir(&self, target: &BuildTarget) -> Result<PathBuf, UnknownCellError> {
    Ok(self.root_of(target.cell())?.join(target.base_path_buf()))
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.named.keys().map(String::as_str)
  }
}
