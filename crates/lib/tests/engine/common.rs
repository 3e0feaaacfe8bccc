use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kiln_lib::project::Project;
use kiln_lib::target::BuildTarget;

pub fn write(root: &Path, rel: &str, contents: &str) -> PathBuf {
  let path = root.join(rel);
  std::fs::create_dir_all(path.parent().unwrap()).unwrap();
  std::fs::write(&path, contents).unwrap();
  path
}

pub fn write_executable(root: &Path, rel: &str, body: &str) -> PathBuf {
  let path = write(root, rel, &format!("#!/bin/sh\n{body}\n"));
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  path
}

pub fn target(text: &str) -> BuildTarget {
  BuildTarget::parse(text).unwrap()
}

pub fn targets(texts: &[&str]) -> BTreeSet<BuildTarget> {
  texts.iter().map(|text| target(text)).collect()
}

/// A project whose `//app:greeting` concatenates an exported file and a
/// generated one. Every genrule run appends a line to `runs.log`.
pub fn greeting_project(root: &Path) {
  write(root, "kiln.toml", "[cache]\nmode = \"dir\"\n");
  write(root, "lib/name.txt", "world");
  write(
    root,
    "lib/BUILD.json",
    r#"[
  {"type": "export_file", "name": "name.txt", "visibility": ["PUBLIC"]},
  {"type": "genrule", "name": "hello", "cmd": "echo hello > $OUT; echo hello >> runs.log", "out": "hello.txt", "visibility": ["PUBLIC"]}
]"#,
  );
  write(
    root,
    "app/BUILD.json",
    r#"[
  {
    "type": "genrule",
    "name": "greeting",
    "srcs": ["//lib:name.txt"],
    "cmd": "cat $(location //lib:hello) $SRCS > $OUT; echo greeting >> runs.log",
    "out": "greeting.txt"
  }
]"#,
  );
}

pub fn load(root: &Path) -> Project {
  Project::load(root).unwrap()
}

pub fn runs(root: &Path) -> Vec<String> {
  std::fs::read_to_string(root.join("runs.log"))
    .unwrap_or_default()
    .lines()
    .map(str::to_string)
    .collect()
}
