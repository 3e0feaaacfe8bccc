use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::trace;

use super::{RuleKey, RuleKeyBuilder, RuleKeyContext, RuleKeyError};
use crate::rules::{BuildRule, BuildRuleResolver};
use crate::target::BuildTarget;
use crate::util::hash::{ContentHash, HashError, hash_directory, hash_file};

/// Memoized content hashes of input files, keyed by absolute path.
#[derive(Debug, Default)]
pub struct FileHashCache {
  hashes: Mutex<HashMap<PathBuf, ContentHash>>,
}

impl FileHashCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, path: &Path) -> Result<ContentHash, HashError> {
    if let Some(hash) = self.lock().get(path) {
      return Ok(hash.clone());
    }
    let hash = if path.is_dir() {
      hash_directory(path, &[])?
    } else {
      hash_file(path)?
    };
    self.lock().insert(path.to_path_buf(), hash.clone());
    Ok(hash)
  }

  /// Forget a path, e.g. after it was rewritten.
  pub fn invalidate(&self, path: &Path) {
    self.lock().remove(path);
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, ContentHash>> {
    self.hashes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Computes and memoizes rule keys for the rules of one resolver.
#[derive(Debug, Default)]
pub struct RuleKeyFactory {
  file_hashes: FileHashCache,
  keys: Mutex<HashMap<BuildTarget, RuleKey>>,
}

impl RuleKeyFactory {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn file_hashes(&self) -> &FileHashCache {
    &self.file_hashes
  }

  /// Key of `rule`: its type, its own fields, then its dependencies' keys
  /// sorted by target. Dependency keys are computed first.
  pub fn compute(&self, rule: &dyn BuildRule, resolver: &BuildRuleResolver) -> Result<RuleKey, RuleKeyError> {
    if let Some(key) = self.cached(rule.target()) {
      return Ok(key);
    }

    let mut dep_keys = BTreeMap::new();
    for dep in rule.deps() {
      let dep_rule = resolver.get(dep).ok_or_else(|| RuleKeyError::NoSuchRule {
        target: dep.to_string(),
      })?;
      dep_keys.insert(dep.clone(), self.compute(dep_rule.as_ref(), resolver)?);
    }

    let context = RuleKeyContext {
      file_hashes: &self.file_hashes,
      dep_keys: &dep_keys,
    };
    let mut builder = RuleKeyBuilder::with_context(rule.rule_type().as_str(), context);
    rule.append_to_rule_key(&mut builder)?;
    builder.set(".deps", &dep_keys)?;
    let key = builder.build();

    trace!(target = %rule.target(), rule_key = %key, "computed rule key");
    self
      .keys
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .insert(rule.target().clone(), key);
    Ok(key)
  }

  fn cached(&self, target: &BuildTarget) -> Option<RuleKey> {
    self
      .keys
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .get(target)
      .copied()
  }
}
