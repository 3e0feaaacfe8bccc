//! Rule keys.
//!
//! A rule key fingerprints everything that can change a rule's output: its
//! type, the fields it folds in through `RuleKeyAppendable`, the content of
//! its input files and the keys of its dependencies. Equal keys mean the
//! cached artifact can be reused.
//!
//! Values are folded as tagged, length-prefixed records so that adjacent
//! fields can never run together. Unordered collections are sorted first.

pub mod factory;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::target::BuildTarget;
use crate::util::hash::{ContentHash, HashError};
use crate::util::paths::to_slash;

pub use factory::{FileHashCache, RuleKeyFactory};

#[derive(Debug, Error)]
pub enum RuleKeyError {
  #[error("field '{field}' cannot be folded into a rule key: {reason}")]
  UnstableField { field: String, reason: String },

  #[error("no rule key available for dependency {target}")]
  MissingDependencyKey { target: String },

  #[error("field '{field}' needs file or dependency information, but the key is built without it")]
  MissingContext { field: String },

  #[error("no build rule for {target}")]
  NoSuchRule { target: String },

  #[error("failed to hash input: {0}")]
  Hash(#[from] HashError),
}

/// An opaque 256-bit fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleKey([u8; 32]);

impl RuleKey {
  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl fmt::Display for RuleKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl fmt::Debug for RuleKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "RuleKey({})", self.to_hex())
  }
}

impl std::str::FromStr for RuleKey {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s).map_err(|e| format!("invalid rule key '{s}': {e}"))?;
    let bytes: [u8; 32] = bytes
      .try_into()
      .map_err(|_| format!("invalid rule key '{s}': expected 32 bytes"))?;
    Ok(Self(bytes))
  }
}

impl Serialize for RuleKey {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for RuleKey {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    String::deserialize(deserializer)?.parse().map_err(serde::de::Error::custom)
  }
}

/// File hashes and dependency keys available while folding one rule.
#[derive(Clone, Copy)]
pub struct RuleKeyContext<'a> {
  pub file_hashes: &'a FileHashCache,
  pub dep_keys: &'a BTreeMap<BuildTarget, RuleKey>,
}

pub struct RuleKeyBuilder<'a> {
  hasher: Sha256,
  scope: Vec<String>,
  context: Option<RuleKeyContext<'a>>,
}

impl<'a> RuleKeyBuilder<'a> {
  /// A builder without file or dependency information. The rule type is
  /// always the first value folded.
  pub fn new(rule_type: &str) -> Self {
    let mut builder = Self {
      hasher: Sha256::new(),
      scope: Vec::new(),
      context: None,
    };
    builder.record(b't', rule_type.as_bytes());
    builder
  }

  pub fn with_context(rule_type: &str, context: RuleKeyContext<'a>) -> Self {
    let mut builder = Self::new(rule_type);
    builder.context = Some(context);
    builder
  }

  /// Fold a named field.
  pub fn set<V: RuleKeyAppendable + ?Sized>(&mut self, key: &str, value: &V) -> Result<&mut Self, RuleKeyError> {
    self.record(b'k', key.as_bytes());
    self.scope.push(key.to_string());
    let result = value.append_to_rule_key(self);
    self.scope.pop();
    result.map(|()| self)
  }

  fn record(&mut self, tag: u8, bytes: &[u8]) {
    self.hasher.update([tag]);
    self.hasher.update((bytes.len() as u64).to_le_bytes());
    self.hasher.update(bytes);
  }

  pub fn feed_str(&mut self, value: &str) {
    self.record(b's', value.as_bytes());
  }

  pub fn feed_bytes(&mut self, value: &[u8]) {
    self.record(b'b', value);
  }

  pub fn feed_u64(&mut self, value: u64) {
    self.record(b'u', &value.to_le_bytes());
  }

  pub fn feed_i64(&mut self, value: i64) {
    self.record(b'i', &value.to_le_bytes());
  }

  pub fn feed_bool(&mut self, value: bool) {
    self.record(b'z', &[value as u8]);
  }

  pub fn feed_f64(&mut self, value: f64) -> Result<(), RuleKeyError> {
    if value.is_nan() {
      return Err(self.unstable("NaN has no stable representation"));
    }
    // -0.0 == 0.0 must fold identically.
    let value = if value == 0.0 { 0.0f64 } else { value };
    self.record(b'f', &value.to_bits().to_le_bytes());
    Ok(())
  }

  pub fn feed_none(&mut self) {
    self.record(b'n', &[]);
  }

  pub fn feed_rule_key(&mut self, key: &RuleKey) {
    self.record(b'r', key.as_bytes());
  }

  /// Start a sequence of `len` elements.
  pub fn begin_sequence(&mut self, len: usize) {
    self.record(b'[', &(len as u64).to_le_bytes());
  }

  /// Start a map of `len` entries.
  pub fn begin_map(&mut self, len: usize) {
    self.record(b'{', &(len as u64).to_le_bytes());
  }

  /// The dotted path of the field currently being folded.
  pub fn current_field(&self) -> String {
    if self.scope.is_empty() {
      "<root>".to_string()
    } else {
      self.scope.join(".")
    }
  }

  /// An error for a value in the current field that cannot be folded stably.
  pub fn unstable(&self, reason: &str) -> RuleKeyError {
    RuleKeyError::UnstableField {
      field: self.current_field(),
      reason: reason.to_string(),
    }
  }

  fn context(&self) -> Result<RuleKeyContext<'a>, RuleKeyError> {
    self.context.ok_or_else(|| RuleKeyError::MissingContext {
      field: self.current_field(),
    })
  }

  /// Fold a named input file by content.
  pub fn set_file(&mut self, key: &str, path: &Path) -> Result<&mut Self, RuleKeyError> {
    self.record(b'k', key.as_bytes());
    self.scope.push(key.to_string());
    let result = self.feed_file(path);
    self.scope.pop();
    result.map(|()| self)
  }

  /// Fold an input file (or directory) by content, never by location.
  pub fn feed_file(&mut self, path: &Path) -> Result<(), RuleKeyError> {
    let hash: ContentHash = self.context()?.file_hashes.get(path)?;
    self.record(b'h', hash.0.as_bytes());
    Ok(())
  }

  /// Fold the key of a dependency rule.
  pub fn feed_dependency(&mut self, target: &BuildTarget) -> Result<(), RuleKeyError> {
    let key = *self
      .context()?
      .dep_keys
      .get(target)
      .ok_or_else(|| RuleKeyError::MissingDependencyKey {
        target: target.to_string(),
      })?;
    self.feed_rule_key(&key);
    Ok(())
  }

  pub fn build(self) -> RuleKey {
    RuleKey(self.hasher.finalize().into())
  }
}

/// A value that can contribute its identity to a rule key.
pub trait RuleKeyAppendable {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError>;
}

impl RuleKeyAppendable for str {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.feed_str(self);
    Ok(())
  }
}

impl RuleKeyAppendable for String {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.feed_str(self);
    Ok(())
  }
}

impl RuleKeyAppendable for bool {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.feed_bool(*self);
    Ok(())
  }
}

macro_rules! unsigned_appendable {
  ($($ty:ty),*) => {
    $(impl RuleKeyAppendable for $ty {
      fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
        builder.feed_u64(*self as u64);
        Ok(())
      }
    })*
  };
}

macro_rules! signed_appendable {
  ($($ty:ty),*) => {
    $(impl RuleKeyAppendable for $ty {
      fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
        builder.feed_i64(*self as i64);
        Ok(())
      }
    })*
  };
}

unsigned_appendable!(u8, u16, u32, u64, usize);
signed_appendable!(i8, i16, i32, i64);

impl RuleKeyAppendable for f64 {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.feed_f64(*self)
  }
}

/// Paths fold as `/`-separated text. Inputs whose content matters go
/// through `RuleKeyBuilder::feed_file` instead.
impl RuleKeyAppendable for Path {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.feed_str(&to_slash(self));
    Ok(())
  }
}

impl RuleKeyAppendable for PathBuf {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    self.as_path().append_to_rule_key(builder)
  }
}

impl RuleKeyAppendable for BuildTarget {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.feed_str(&self.to_string());
    Ok(())
  }
}

impl RuleKeyAppendable for RuleKey {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.feed_rule_key(self);
    Ok(())
  }
}

impl<T: RuleKeyAppendable + ?Sized> RuleKeyAppendable for &T {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    (**self).append_to_rule_key(builder)
  }
}

impl<T: RuleKeyAppendable + ?Sized> RuleKeyAppendable for Box<T> {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    (**self).append_to_rule_key(builder)
  }
}

impl<T: RuleKeyAppendable + ?Sized> RuleKeyAppendable for Arc<T> {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    (**self).append_to_rule_key(builder)
  }
}

impl<T: RuleKeyAppendable> RuleKeyAppendable for Option<T> {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    match self {
      Some(value) => value.append_to_rule_key(builder),
      None => {
        builder.feed_none();
        Ok(())
      }
    }
  }
}

impl<T: RuleKeyAppendable> RuleKeyAppendable for [T] {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.begin_sequence(self.len());
    self.iter().try_for_each(|item| item.append_to_rule_key(builder))
  }
}

impl<T: RuleKeyAppendable> RuleKeyAppendable for Vec<T> {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    self.as_slice().append_to_rule_key(builder)
  }
}

impl<T: RuleKeyAppendable> RuleKeyAppendable for BTreeSet<T> {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.begin_sequence(self.len());
    self.iter().try_for_each(|item| item.append_to_rule_key(builder))
  }
}

impl<K: RuleKeyAppendable, V: RuleKeyAppendable> RuleKeyAppendable for BTreeMap<K, V> {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    builder.begin_map(self.len());
    self.iter().try_for_each(|(k, v)| {
      k.append_to_rule_key(builder)?;
      v.append_to_rule_key(builder)
    })
  }
}

impl<T: RuleKeyAppendable + Ord, S> RuleKeyAppendable for HashSet<T, S> {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    let sorted: BTreeSet<&T> = self.iter().collect();
    sorted.append_to_rule_key(builder)
  }
}

impl<K: RuleKeyAppendable + Ord, V: RuleKeyAppendable, S> RuleKeyAppendable for HashMap<K, V, S> {
  fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError> {
    let sorted: BTreeMap<&K, &V> = self.iter().collect();
    sorted.append_to_rule_key(builder)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(rule_type: &str, fold: impl FnOnce(&mut RuleKeyBuilder<'_>) -> Result<(), RuleKeyError>) -> RuleKey {
    let mut builder = RuleKeyBuilder::new(rule_type);
    fold(&mut builder).unwrap();
    builder.build()
  }

  #[test]
  fn identical_inputs_give_identical_keys() {
    let fold = |b: &mut RuleKeyBuilder<'_>| {
      b.set("out", "a.txt")?.set("flags", &vec!["-O2".to_string()])?;
      Ok(())
    };
    assert_eq!(key("genrule", fold), key("genrule", fold));
  }

  #[test]
  fn rule_type_is_always_folded() {
    let fold = |b: &mut RuleKeyBuilder<'_>| b.set("out", "a.txt").map(|_| ());
    assert_ne!(key("genrule", fold), key("export_file", fold));
  }

  #[test]
  fn every_field_participates() {
    let base = key("t", |b| b.set("a", "x")?.set("b", &1u32).map(|_| ()));
    assert_ne!(base, key("t", |b| b.set("a", "y")?.set("b", &1u32).map(|_| ())));
    assert_ne!(base, key("t", |b| b.set("a", "x")?.set("b", &2u32).map(|_| ())));
    assert_ne!(base, key("t", |b| b.set("c", "x")?.set("b", &1u32).map(|_| ())));
  }

  #[test]
  fn adjacent_strings_do_not_run_together() {
    let ab_c = key("t", |b| b.set("v", &vec!["ab".to_string(), "c".to_string()]).map(|_| ()));
    let a_bc = key("t", |b| b.set("v", &vec!["a".to_string(), "bc".to_string()]).map(|_| ()));
    assert_ne!(ab_c, a_bc);
  }

  #[test]
  fn unordered_collections_are_sorted() {
    let forward: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let backward: HashSet<String> = ["c", "b", "a"].iter().map(|s| s.to_string()).collect();
    assert_eq!(
      key("t", |b| b.set("s", &forward).map(|_| ())),
      key("t", |b| b.set("s", &backward).map(|_| ()))
    );

    let ordered = key("t", |b| b.set("v", &vec!["a", "b"]).map(|_| ()));
    let reversed = key("t", |b| b.set("v", &vec!["b", "a"]).map(|_| ()));
    assert_ne!(ordered, reversed);
  }

  #[test]
  fn nan_is_fatal_and_names_the_field() {
    let mut builder = RuleKeyBuilder::new("t");
    let err = builder.set("ratio", &f64::NAN).err().unwrap();
    assert_eq!(
      err.to_string(),
      "field 'ratio' cannot be folded into a rule key: NaN has no stable representation"
    );
  }

  #[test]
  fn files_and_dependencies_need_context() {
    let mut builder = RuleKeyBuilder::new("t");
    let err = builder.feed_file(Path::new("x")).unwrap_err();
    assert!(matches!(err, RuleKeyError::MissingContext { .. }));
  }

  #[test]
  fn named_files_fold_by_content() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");
    std::fs::write(&a, "same").unwrap();
    std::fs::write(&b, "same").unwrap();

    let file_hashes = factory::FileHashCache::new();
    let dep_keys = BTreeMap::new();
    let context = RuleKeyContext {
      file_hashes: &file_hashes,
      dep_keys: &dep_keys,
    };
    let fold = |path: &Path| {
      let mut builder = RuleKeyBuilder::with_context("t", context);
      builder.set_file("src", path).unwrap();
      builder.build()
    };
    assert_eq!(fold(&a), fold(&b));

    std::fs::write(dir.path().join("c.txt"), "other").unwrap();
    assert_ne!(fold(&a), fold(&dir.path().join("c.txt")));
  }

  #[test]
  fn rule_key_round_trips_through_text() {
    let k = key("t", |_| Ok(()));
    let parsed: RuleKey = k.to_hex().parse().unwrap();
    assert_eq!(parsed, k);
    assert!("zz".parse::<RuleKey>().is_err());
  }
}
