//! Target hashes.
//!
//! Unlike rule keys, a target hash needs no materialized rules: it covers the
//! raw declaration, the contents of every referenced input file and the
//! hashes of all dependencies. Editing or deleting a referenced file changes
//! the hash of its owner and of everything depending on it.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use super::{GraphError, TargetGraph};
use crate::cell::CellRoots;
use crate::target::BuildTarget;
use crate::util::hash::{ContentHash, hash_file};
use crate::util::paths::to_slash;

pub type TargetHashes = BTreeMap<BuildTarget, ContentHash>;

/// Stands in for the content hash of an input that cannot be read.
const MISSING_INPUT: &str = "missing";

pub fn target_hashes(graph: &TargetGraph, cells: &CellRoots) -> Result<TargetHashes, GraphError> {
  let mut hashes = TargetHashes::new();
  for node in graph.topological_order()? {
    let cell_root = cells.root_of(node.target().cell())?;

    let mut hasher = Sha256::new();
    hasher.update(node.target().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(node.raw_hash().0.as_bytes());

    for input in node.inputs() {
      let content = hash_file(&cell_root.join(input))
        .map(|h| h.0)
        .unwrap_or_else(|_| MISSING_INPUT.to_string());
      hasher.update(format!("\ninput:{}:{}", to_slash(input), content).as_bytes());
    }

    for dep in graph.dependencies(node.target()) {
      if let Some(dep_hash) = hashes.get(&dep) {
        hasher.update(format!("\ndep:{}:{}", dep, dep_hash).as_bytes());
      }
    }

    hashes.insert(node.target().clone(), ContentHash(hex::encode(hasher.finalize())));
  }
  Ok(hashes)
}
