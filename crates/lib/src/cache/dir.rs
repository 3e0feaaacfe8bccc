//! A local directory cache.
//!
//! Each entry lives at `<dir>/<rulekey>/`:
//!
//! ```text
//! files/...          captured outputs, project-relative
//! metadata.json      rule key and file list
//! .kiln-complete     format version and content hash of files/, written last
//! ```
//!
//! Entries are assembled in a temporary directory and renamed into place.
//! A lookup that finds no marker, an unreadable marker or a hash mismatch
//! removes the entry and reports a miss.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use super::{Artifact, ArtifactCache, CacheError, read_file};
use crate::consts::{CACHE_COMPLETE_MARKER, CACHE_FORMAT_VERSION};
use crate::rulekey::RuleKey;
use crate::util::hash::{ContentHash, HashError, hash_directory};

const FILES_DIR: &str = "files";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Serialize, Deserialize)]
struct EntryMetadata {
  version: u32,
  rule_key: RuleKey,
  files: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CompleteMarker {
  version: u32,
  content_hash: ContentHash,
}

#[derive(Debug, Clone)]
pub struct DirArtifactCache {
  dir: PathBuf,
}

impl DirArtifactCache {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  fn entry_path(&self, key: &RuleKey) -> PathBuf {
    self.dir.join(key.to_hex())
  }

  /// Whether `entry` holds a complete, uncorrupted entry.
  fn verify(entry: &Path) -> bool {
    let marker_path = entry.join(CACHE_COMPLETE_MARKER);
    let marker = match std::fs::read_to_string(&marker_path) {
      Ok(content) => content,
      Err(e) => {
        debug!(path = ?entry, error = %e, "cache entry has no completion marker");
        return false;
      }
    };
    let marker: CompleteMarker = match serde_json::from_str(&marker) {
      Ok(marker) => marker,
      Err(e) => {
        debug!(path = ?entry, error = %e, "invalid cache marker");
        return false;
      }
    };
    if marker.version != CACHE_FORMAT_VERSION {
      debug!(path = ?entry, version = marker.version, "cache entry has another format version");
      return false;
    }
    match hash_directory(&entry.join(FILES_DIR), &[]) {
      Ok(actual) if actual == marker.content_hash => true,
      Ok(actual) => {
        warn!(
          path = ?entry,
          expected = %marker.content_hash,
          actual = %actual,
          "cache entry content does not match its marker"
        );
        false
      }
      Err(e) => {
        warn!(path = ?entry, error = %e, "failed to hash cache entry");
        false
      }
    }
  }

  fn read_entry(entry: &Path) -> Result<Artifact, CacheError> {
    let files = entry.join(FILES_DIR);
    let mut artifact = Artifact::new();
    for item in WalkDir::new(&files).sort_by_file_name() {
      let item = item.map_err(|e| HashError::WalkDir {
        path: files.display().to_string(),
        message: e.to_string(),
      })?;
      if !item.file_type().is_file() {
        continue;
      }
      let relative = item.path().strip_prefix(&files).unwrap_or(item.path());
      artifact.insert(relative, read_file(item.path())?);
    }
    Ok(artifact)
  }

  fn write_entry(staging: &Path, key: &RuleKey, artifact: &Artifact) -> Result<(), CacheError> {
    let files = staging.join(FILES_DIR);
    std::fs::create_dir_all(&files).map_err(CacheError::io("create directory", &files))?;
    artifact.materialize(&files)?;

    let metadata = EntryMetadata {
      version: CACHE_FORMAT_VERSION,
      rule_key: *key,
      files: artifact.paths(),
    };
    let metadata_path = staging.join(METADATA_FILE);
    std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)
      .map_err(CacheError::io("write", &metadata_path))?;

    let marker = CompleteMarker {
      version: CACHE_FORMAT_VERSION,
      content_hash: hash_directory(&files, &[])?,
    };
    let marker_path = staging.join(CACHE_COMPLETE_MARKER);
    std::fs::write(&marker_path, format!("{}\n", serde_json::to_string(&marker)?))
      .map_err(CacheError::io("write", &marker_path))?;
    Ok(())
  }

  fn remove_entry(entry: &Path) -> Result<(), CacheError> {
    match std::fs::remove_dir_all(entry) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(CacheError::Io {
        action: "remove",
        path: entry.to_path_buf(),
        source: e,
      }),
    }
  }
}

#[async_trait]
impl ArtifactCache for DirArtifactCache {
  async fn lookup(&self, key: &RuleKey) -> Result<Option<Artifact>, CacheError> {
    let entry = self.entry_path(key);
    if !entry.exists() {
      trace!(rule_key = %key, "cache miss");
      return Ok(None);
    }
    if !Self::verify(&entry) {
      warn!(rule_key = %key, path = ?entry, "removing incomplete cache entry");
      Self::remove_entry(&entry)?;
      return Ok(None);
    }
    let artifact = Self::read_entry(&entry)?;
    debug!(rule_key = %key, files = artifact.len(), "cache hit");
    Ok(Some(artifact))
  }

  async fn store(&self, key: &RuleKey, artifact: &Artifact) -> Result<(), CacheError> {
    let entry = self.entry_path(key);
    if entry.exists() {
      if Self::verify(&entry) {
        trace!(rule_key = %key, "cache entry already present");
        return Ok(());
      }
      Self::remove_entry(&entry)?;
    }

    std::fs::create_dir_all(&self.dir).map_err(CacheError::io("create directory", &self.dir))?;
    let staging = tempfile::Builder::new()
      .prefix(".tmp-")
      .tempdir_in(&self.dir)
      .map_err(CacheError::io("create staging directory in", &self.dir))?;
    Self::write_entry(staging.path(), key, artifact)?;

    let staging = staging.keep();
    if let Err(e) = std::fs::rename(&staging, &entry) {
      // Another writer got there first; its entry is equivalent.
      debug!(rule_key = %key, error = %e, "cache entry rename failed");
      Self::remove_entry(&staging)?;
      return Ok(());
    }
    debug!(rule_key = %key, files = artifact.len(), "stored cache entry");
    Ok(())
  }
}
