//! Artifact caches.
//!
//! An artifact is the set of files a rule produced, keyed by the rule's key.
//! A lookup hit restores those files in place of running the rule's steps.
//! Caches never overwrite an existing entry: equal keys mean equal outputs.

pub mod dir;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;
use walkdir::WalkDir;

use crate::rulekey::RuleKey;
use crate::util::hash::HashError;
use crate::util::paths::to_slash;

pub use dir::DirArtifactCache;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("failed to {action} {path}: {source}")]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("rule output {path} does not exist")]
  MissingOutput { path: PathBuf },

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("failed to encode cache metadata: {0}")]
  Metadata(#[from] serde_json::Error),
}

impl CacheError {
  pub(crate) fn io(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> Self {
    let path = path.to_path_buf();
    move |source| CacheError::Io { action, path, source }
  }
}

/// One captured file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
  pub contents: Vec<u8>,
  pub executable: bool,
}

/// Files captured from a rule's outputs, keyed by project-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
  files: BTreeMap<PathBuf, ArtifactFile>,
}

impl Artifact {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, path: impl Into<PathBuf>, file: ArtifactFile) {
    self.files.insert(path.into(), file);
  }

  pub fn files(&self) -> impl Iterator<Item = (&Path, &ArtifactFile)> {
    self.files.iter().map(|(path, file)| (path.as_path(), file))
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  /// Read every file under `outputs`, each a project-relative file or directory.
  pub fn collect(project_root: &Path, outputs: &[PathBuf]) -> Result<Self, CacheError> {
    let mut artifact = Self::new();
    for output in outputs {
      let absolute = project_root.join(output);
      if !absolute.exists() {
        return Err(CacheError::MissingOutput { path: output.clone() });
      }
      for entry in WalkDir::new(&absolute).sort_by_file_name() {
        let entry = entry.map_err(|e| HashError::WalkDir {
          path: absolute.display().to_string(),
          message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
          continue;
        }
        let relative = entry.path().strip_prefix(project_root).unwrap_or(entry.path()).to_path_buf();
        artifact.insert(relative, read_file(entry.path())?);
      }
    }
    trace!(files = artifact.len(), "collected artifact");
    Ok(artifact)
  }

  /// Write every file below `root`, replacing what is there.
  pub fn materialize(&self, root: &Path) -> Result<(), CacheError> {
    for (relative, file) in &self.files {
      let path = root.join(relative);
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(CacheError::io("create directory", parent))?;
      }
      std::fs::write(&path, &file.contents).map_err(CacheError::io("write", &path))?;
      if file.executable {
        set_executable(&path)?;
      }
    }
    Ok(())
  }

  /// Paths in `/` form, for metadata and messages.
  pub fn paths(&self) -> Vec<String> {
    self.files.keys().map(|path| to_slash(path)).collect()
  }
}

pub(crate) fn read_file(path: &Path) -> Result<ArtifactFile, CacheError> {
  let contents = std::fs::read(path).map_err(CacheError::io("read", path))?;
  Ok(ArtifactFile {
    contents,
    executable: is_executable(path),
  })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  path
    .metadata()
    .map(|m| m.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
  false
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), CacheError> {
  use std::os::unix::fs::PermissionsExt;
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(CacheError::io("chmod", path))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), CacheError> {
  Ok(())
}

#[async_trait]
pub trait ArtifactCache: Send + Sync + fmt::Debug {
  async fn lookup(&self, key: &RuleKey) -> Result<Option<Artifact>, CacheError>;

  /// Store `artifact` under `key` unless an entry already exists.
  async fn store(&self, key: &RuleKey, artifact: &Artifact) -> Result<(), CacheError>;
}

/// Caches nothing.
#[derive(Debug, Default)]
pub struct NoopArtifactCache;

#[async_trait]
impl ArtifactCache for NoopArtifactCache {
  async fn lookup(&self, _key: &RuleKey) -> Result<Option<Artifact>, CacheError> {
    Ok(None)
  }

  async fn store(&self, _key: &RuleKey, _artifact: &Artifact) -> Result<(), CacheError> {
    Ok(())
  }
}

/// A process-local cache.
#[derive(Debug, Default)]
pub struct InMemoryArtifactCache {
  entries: Mutex<HashMap<RuleKey, Artifact>>,
}

impl InMemoryArtifactCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RuleKey, Artifact>> {
    self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

#[async_trait]
impl ArtifactCache for InMemoryArtifactCache {
  async fn lookup(&self, key: &RuleKey) -> Result<Option<Artifact>, CacheError> {
    Ok(self.lock().get(key).cloned())
  }

  async fn store(&self, key: &RuleKey, artifact: &Artifact) -> Result<(), CacheError> {
    self.lock().entry(*key).or_insert_with(|| artifact.clone());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::write_file;

  fn key(byte: u8) -> RuleKey {
    format!("{byte:02x}").repeat(32).parse().unwrap()
  }

  #[test]
  fn collect_walks_directories_and_materialize_restores() {
    let src = tempfile::tempdir().unwrap();
    write_file(src.path(), "kiln-out/gen/a/out.txt", "one");
    write_file(src.path(), "kiln-out/gen/b/dir/x.txt", "x");
    write_file(src.path(), "kiln-out/gen/b/dir/sub/y.txt", "y");

    let artifact = Artifact::collect(
      src.path(),
      &[PathBuf::from("kiln-out/gen/a/out.txt"), PathBuf::from("kiln-out/gen/b/dir")],
    )
    .unwrap();
    assert_eq!(
      artifact.paths(),
      vec!["kiln-out/gen/a/out.txt", "kiln-out/gen/b/dir/sub/y.txt", "kiln-out/gen/b/dir/x.txt"]
    );

    let dest = tempfile::tempdir().unwrap();
    artifact.materialize(dest.path()).unwrap();
    assert_eq!(std::fs::read_to_string(dest.path().join("kiln-out/gen/b/dir/sub/y.txt")).unwrap(), "y");
  }

  #[test]
  fn missing_output_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Artifact::collect(dir.path(), &[PathBuf::from("kiln-out/nothing")]).unwrap_err();
    assert_eq!(err.to_string(), "rule output kiln-out/nothing does not exist");
  }

  #[cfg(unix)]
  #[test]
  fn executable_bit_survives_a_round_trip() {
    use std::os::unix::fs::PermissionsExt;
    let src = tempfile::tempdir().unwrap();
    let script = crate::util::testutil::write_script(src.path(), "out/run.sh", "true");
    let artifact = Artifact::collect(src.path(), &[PathBuf::from("out")]).unwrap();

    let dest = tempfile::tempdir().unwrap();
    artifact.materialize(dest.path()).unwrap();
    let mode = std::fs::metadata(dest.path().join("out/run.sh")).unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0);
    assert!(script.exists());
  }

  #[tokio::test]
  async fn in_memory_cache_keeps_the_first_entry() {
    let cache = InMemoryArtifactCache::new();
    assert!(cache.lookup(&key(1)).await.unwrap().is_none());

    let mut first = Artifact::new();
    first.insert("a", ArtifactFile { contents: b"first".to_vec(), executable: false });
    let mut second = Artifact::new();
    second.insert("a", ArtifactFile { contents: b"second".to_vec(), executable: false });

    cache.store(&key(1), &first).await.unwrap();
    cache.store(&key(1), &second).await.unwrap();
    assert_eq!(cache.lookup(&key(1)).await.unwrap(), Some(first));
    assert_eq!(cache.len(), 1);
  }

  #[tokio::test]
  async fn noop_cache_never_hits() {
    let cache = NoopArtifactCache;
    cache.store(&key(2), &Artifact::new()).await.unwrap();
    assert!(cache.lookup(&key(2)).await.unwrap().is_none());
  }
}
