//! Lexical path helpers.
//!
//! Declarations use `/`-separated project-relative paths. These helpers
//! normalize them without touching the filesystem.

use std::path::{Component, Path, PathBuf};

/// Lexically normalize `rel` against the package directory `base`.
///
/// Returns `None` when the result would escape the project root.
pub fn normalize_relative(base: &Path, rel: &Path) -> Option<PathBuf> {
  let mut parts: Vec<String> = Vec::new();
  for component in base.components().chain(rel.components()) {
    match component {
      Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
      Component::CurDir => {}
      Component::ParentDir => {
        parts.pop()?;
      }
      Component::RootDir | Component::Prefix(_) => return None,
    }
  }
  Some(parts.iter().collect())
}

/// Render a project-relative path with `/` separators.
pub fn to_slash(path: &Path) -> String {
  path
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}

/// Whether `path` is `base` or lies beneath it. The empty base contains everything.
pub fn is_under(path: &Path, base: &Path) -> bool {
  base.as_os_str().is_empty() || path.starts_with(base)
}

/// Express `path` relative to `base`, rendering `..` segments where needed.
pub fn relativize(base: &Path, path: &Path) -> String {
  let base: Vec<_> = base.components().collect();
  let target: Vec<_> = path.components().collect();
  let common = base.iter().zip(&target).take_while(|(a, b)| a == b).count();

  let mut parts: Vec<String> = std::iter::repeat_n("..".to_string(), base.len() - common).collect();
  parts.extend(target[common..].iter().map(|c| c.as_os_str().to_string_lossy().into_owned()));
  parts.join("/")
}
