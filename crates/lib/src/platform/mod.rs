//! Host platform queries: per-user directories and executable lookup.

pub mod paths;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Search `path_var` (a `PATH`-style list) for an executable named `name`.
///
/// A `name` that already contains a path separator is returned as-is when it exists.
pub fn find_executable(name: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
  let direct = Path::new(name);
  if direct.components().count() > 1 {
    return is_executable(direct).then(|| direct.to_path_buf());
  }

  let path_var = path_var?;
  std::env::split_paths(path_var)
    .flat_map(|dir| candidates(&dir, name))
    .find(|candidate| is_executable(candidate))
}

#[cfg(windows)]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
  vec![dir.join(name), dir.join(format!("{name}.exe")), dir.join(format!("{name}.cmd"))]
}

#[cfg(not(windows))]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
  vec![dir.join(name)]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  path
    .metadata()
    .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
  path.is_file()
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
  use super::*;
  use std::os::unix::fs::PermissionsExt;

  #[test]
  fn finds_executable_in_search_path() {
    let temp = tempfile::tempdir().unwrap();
    let exe = temp.path().join("mytool");
    std::fs::write(&exe, "#!/bin/sh\n").unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

    let path_var = std::env::join_paths(["/nonexistent-dir", temp.path().to_str().unwrap()]).unwrap();
    assert_eq!(find_executable("mytool", Some(&path_var)), Some(exe));
  }

  #[test]
  fn skips_non_executable_files() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(temp.path().join("plain"), "data").unwrap();

    let path_var = temp.path().as_os_str().to_owned();
    assert_eq!(find_executable("plain", Some(&path_var)), None);
    assert_eq!(find_executable("plain", None), None);
  }
}
