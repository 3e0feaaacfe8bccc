//! Package ownership.
//!
//! Every directory that holds a declaration file is a package. A path belongs
//! to the package of its nearest ancestor directory holding one. Ignored
//! directories (configured ones plus the output and cache directories) are
//! never packages and are not descended into.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::consts::{DEFAULT_CACHE_DIR, OUTPUT_DIR};

#[derive(Debug, Error)]
#[error("failed to scan {root} for build files: {message}")]
pub struct BuildFileTreeError {
  pub root: PathBuf,
  pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct BuildFileTree {
  packages: BTreeSet<PathBuf>,
}

impl BuildFileTree {
  /// Walk `root` and record every directory containing `build_file_name`.
  pub fn scan(root: &Path, build_file_name: &str, ignore: &[PathBuf]) -> Result<Self, BuildFileTreeError> {
    let ignored: BTreeSet<PathBuf> = ignore
      .iter()
      .cloned()
      .chain([PathBuf::from(OUTPUT_DIR), PathBuf::from(DEFAULT_CACHE_DIR)])
      .collect();

    let mut packages = BTreeSet::new();
    let walker = WalkDir::new(root).sort_by_file_name().into_iter().filter_entry(|e| {
      let rel = e.path().strip_prefix(root).unwrap_or(e.path());
      !(e.file_type().is_dir() && ignored.contains(rel))
    });

    for entry in walker {
      let entry = entry.map_err(|e| BuildFileTreeError {
        root: root.to_path_buf(),
        message: e.to_string(),
      })?;
      if entry.file_type().is_file() && entry.file_name() == build_file_name {
        let dir = entry.path().parent().unwrap_or(root);
        let rel = dir.strip_prefix(root).unwrap_or(dir).to_path_buf();
        debug!(package = %rel.display(), "found package");
        packages.insert(rel);
      }
    }

    Ok(Self { packages })
  }

  /// A tree over an explicit set of package paths.
  pub fn from_base_paths<I, P>(paths: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
  {
    Self {
      packages: paths.into_iter().map(Into::into).collect(),
    }
  }

  pub fn is_package(&self, base_path: &Path) -> bool {
    self.packages.contains(base_path)
  }

  pub fn packages(&self) -> impl Iterator<Item = &Path> {
    self.packages.iter().map(PathBuf::as_path)
  }

  /// The package owning `path`: its nearest ancestor that is a package.
  pub fn base_path_of_ancestor_target(&self, path: &Path) -> Option<&Path> {
    path
      .ancestors()
      .find_map(|ancestor| self.packages.get(ancestor).map(PathBuf::as_path))
  }

  /// Packages directly beneath `base_path`, with no package in between,
  /// relative to `base_path`.
  pub fn child_paths(&self, base_path: &Path) -> Vec<PathBuf> {
    self
      .packages
      .iter()
      .filter(|candidate| candidate.as_path() != base_path && candidate.starts_with(base_path))
      .filter(|candidate| {
        candidate
          .ancestors()
          .skip(1)
          .take_while(|a| *a != base_path)
          .all(|a| !self.packages.contains(a))
      })
      .filter_map(|candidate| candidate.strip_prefix(base_path).ok().map(Path::to_path_buf))
      .collect()
  }
}
