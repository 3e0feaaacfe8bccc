//! Test utilities for kiln-lib.
//!
//! Helpers for building nodes and graphs from inline declarations, plus
//! scripts that stand in for external tools.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::build_file_tree::BuildFileTree;
use crate::description::DescriptionRegistry;
use crate::graph::TargetGraph;
use crate::node::{NodeParams, TargetNode, TargetNodeFactory};
use crate::parser::RawRuleData;
use crate::target::BuildTarget;

pub fn t(text: &str) -> BuildTarget {
  BuildTarget::parse(text).unwrap()
}

pub fn raw_from(base: &str, attrs: Value) -> RawRuleData {
  let Value::Object(map) = attrs else {
    panic!("declaration must be a JSON object")
  };
  RawRuleData::from_object(None, base, map.into_iter().collect()).unwrap()
}

fn factory() -> TargetNodeFactory {
  TargetNodeFactory::new(
    Arc::new(DescriptionRegistry::with_defaults()),
    NodeParams::new(BuildFileTree::default(), false),
  )
}

/// A node built with the default rule types and boundary checks disabled.
pub fn node_from(base: &str, attrs: Value) -> TargetNode {
  factory().create_node(raw_from(base, attrs)).unwrap()
}

pub fn graph_from(decls: &[(&str, Value)]) -> TargetGraph {
  let factory = factory();
  let nodes = decls
    .iter()
    .map(|(base, attrs)| factory.create_node(raw_from(base, attrs.clone())).unwrap());
  TargetGraph::build(nodes).unwrap()
}

/// Write a file under `root`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, contents: &str) -> PathBuf {
  let path = root.join(rel);
  std::fs::create_dir_all(path.parent().unwrap()).unwrap();
  std::fs::write(&path, contents).unwrap();
  path
}

/// Write an executable shell script under `root`.
#[cfg(unix)]
pub fn write_script(root: &Path, rel: &str, body: &str) -> PathBuf {
  use std::os::unix::fs::PermissionsExt;
  let path = write_file(root, rel, &format!("#!/bin/sh\n{body}\n"));
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  path
}

/// A fake test tool speaking the structured event stream.
///
/// With the list flag it prints `T1` containing `A/test1` and `A/test2`.
/// Otherwise it records its arguments in `args.txt` next to itself, prints a
/// run of the filtered cases and exits with `exit_code`.
#[cfg(unix)]
pub fn write_fake_test_tool(root: &Path, exit_code: i32) -> PathBuf {
  write_script(
    root,
    "tools/fake-test-tool",
    &format!(
      r#"dir=$(dirname "$0")
for arg in "$@"; do
  if [ "$arg" = "-listTestsOnly" ]; then
    echo '{{"event":"begin-target","targetName":"T1"}}'
    echo '{{"event":"begin-test","className":"A","methodName":"test1"}}'
    echo '{{"event":"end-test","className":"A","methodName":"test1","succeeded":true}}'
    echo '{{"event":"begin-test","className":"A","methodName":"test2"}}'
    echo '{{"event":"end-test","className":"A","methodName":"test2","succeeded":true}}'
    echo '{{"event":"end-target","targetName":"T1"}}'
    exit 0
  fi
done
echo "$@" >> "$dir/args.txt"
echo '{{"event":"begin-target","targetName":"T1"}}'
echo '{{"event":"begin-test","className":"A","methodName":"test1"}}'
echo '{{"event":"end-test","className":"A","methodName":"test1","succeeded":false}}'
echo '{{"event":"end-target","targetName":"T1"}}'
exit {exit_code}"#
    ),
  )
}
