//! CLI smoke tests for kiln.
//!
//! These tests run the `kiln` binary against small projects in temporary
//! directories and check exit codes and printed output.

use std::path::Path;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the kiln binary.
fn kiln_cmd() -> Command {
  cargo_bin_cmd!("kiln")
}

fn write(root: &Path, rel: &str, contents: &str) {
  let path = root.join(rel);
  std::fs::create_dir_all(path.parent().unwrap()).unwrap();
  std::fs::write(path, contents).unwrap();
}

/// `//lib:name.txt` is exported, `//app:greeting` generates a file from it
/// and `//lib:name_test` is a test depending on the exported file.
fn project() -> TempDir {
  let temp = TempDir::new().unwrap();
  let root = temp.path();
  write(root, "kiln.toml", "[cache]\nmode = \"dir\"\n");
  write(root, "lib/name.txt", "world");
  write(
    root,
    "lib/BUILD.json",
    r#"[
  {"type": "export_file", "name": "name.txt", "visibility": ["PUBLIC"]},
  {"type": "tool_test", "name": "name_test", "runner": "run.sh", "deps": [":name.txt"]}
]"#,
  );
  write(
    root,
    "app/BUILD.json",
    r#"[{"type": "genrule", "name": "greeting", "srcs": ["//lib:name.txt"], "cmd": "cat $SRCS > $OUT", "out": "greeting.txt"}]"#,
  );
  temp
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  kiln_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  kiln_cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("kiln"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &["build", "test", "targets"] {
    kiln_cmd()
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// build
// =============================================================================

#[cfg(unix)]
#[test]
fn build_produces_outputs_then_hits_the_cache() {
  let temp = project();

  kiln_cmd()
    .arg("--root")
    .arg(temp.path())
    .args(["build", "//app:greeting"])
    .assert()
    .success()
    .stdout(predicate::str::contains("//app:greeting built"))
    .stdout(predicate::str::contains("Build succeeded"));

  let output = temp.path().join("kiln-out/gen/app/greeting/greeting.txt");
  assert_eq!(std::fs::read_to_string(&output).unwrap(), "world");

  std::fs::remove_dir_all(temp.path().join("kiln-out")).unwrap();
  kiln_cmd()
    .arg("--root")
    .arg(temp.path())
    .args(["build", "//app:greeting"])
    .assert()
    .success()
    .stdout(predicate::str::contains("//app:greeting cache hit"));
  assert_eq!(std::fs::read_to_string(&output).unwrap(), "world");
}

#[cfg(unix)]
#[test]
fn failing_command_exits_with_failure() {
  let temp = TempDir::new().unwrap();
  write(
    temp.path(),
    "app/BUILD.json",
    r#"[{"type": "genrule", "name": "broken", "cmd": "echo oops >&2; exit 3", "out": "x"}]"#,
  );

  kiln_cmd()
    .arg("--root")
    .arg(temp.path())
    .args(["build", "//app:broken"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("oops"))
    .stderr(predicate::str::contains("Build failed"));
}

#[test]
fn unknown_target_pattern_fails() {
  let temp = project();

  kiln_cmd()
    .arg("--root")
    .arg(temp.path())
    .args(["build", "//nope:nope"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("no targets match //nope:nope"));
}

#[test]
fn build_requires_a_target() {
  let temp = project();

  kiln_cmd().arg("--root").arg(temp.path()).arg("build").assert().failure();
}

// =============================================================================
// targets
// =============================================================================

#[test]
fn targets_lists_every_target() {
  let temp = project();

  kiln_cmd()
    .arg("--root")
    .arg(temp.path())
    .arg("targets")
    .assert()
    .success()
    .stdout("//app:greeting\n//lib:name.txt\n//lib:name_test\n");
}

#[test]
fn targets_rejects_rule_key_with_target_hash() {
  let temp = project();

  kiln_cmd()
    .arg("--root")
    .arg(temp.path())
    .args(["targets", "--show-rulekey", "--show-target-hash"])
    .assert()
    .failure()
    .stderr(predicate::str::contains(
      "Cannot show rule key and target hash at the same time.",
    ));
}

#[test]
fn targets_json_includes_hashes() {
  let temp = project();

  let output = kiln_cmd()
    .arg("--root")
    .arg(temp.path())
    .args(["targets", "//lib:", "--show-target-hash", "--json"])
    .output()
    .unwrap();
  assert!(output.status.success());

  let infos: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  let infos = infos.as_array().unwrap();
  assert_eq!(infos.len(), 2);
  assert_eq!(infos[0]["target"], "//lib:name.txt");
  assert_eq!(infos[0]["type"], "export_file");
  assert_eq!(infos[0]["target_hash"].as_str().unwrap().len(), 64);
}

#[test]
fn target_hash_follows_referenced_file_content() {
  let temp = project();
  let hash = || {
    let output = kiln_cmd()
      .arg("--root")
      .arg(temp.path())
      .args(["targets", "//app:greeting", "--show-target-hash"])
      .output()
      .unwrap();
    String::from_utf8(output.stdout).unwrap()
  };

  let before = hash();
  write(temp.path(), "lib/name.txt", "there");
  assert_ne!(before, hash());
}

#[test]
fn referenced_file_with_test_detection_lists_owners_and_tests() {
  let temp = project();

  kiln_cmd()
    .arg("--root")
    .arg(temp.path())
    .args(["targets", "--referenced-file", "lib/name.txt", "--detect-test-changes"])
    .assert()
    .success()
    .stdout("//lib:name.txt\n//lib:name_test\n");
}

#[test]
fn show_rulekey_prints_a_key_per_target() {
  let temp = project();

  kiln_cmd()
    .arg("--root")
    .arg(temp.path())
    .args(["targets", "//app:greeting", "--show-rulekey"])
    .assert()
    .success()
    .stdout(predicate::str::is_match(r"^//app:greeting [0-9a-f]{64}\n$").unwrap());
}

// =============================================================================
// test
// =============================================================================

#[cfg(unix)]
#[test]
fn test_command_reports_results() {
  use std::os::unix::fs::PermissionsExt;

  let temp = project();
  let runner = temp.path().join("lib/run.sh");
  std::fs::write(
    &runner,
    "#!/bin/sh\n\
     echo '{\"event\":\"begin-target\",\"targetName\":\"T\"}'\n\
     echo '{\"event\":\"end-test\",\"className\":\"A\",\"methodName\":\"b\",\"succeeded\":true}'\n\
     echo '{\"event\":\"end-target\",\"targetName\":\"T\"}'\n",
  )
  .unwrap();
  std::fs::set_permissions(&runner, std::fs::Permissions::from_mode(0o755)).unwrap();

  kiln_cmd()
    .arg("--root")
    .arg(temp.path())
    .args(["test", "//lib:"])
    .assert()
    .success()
    .stdout(predicate::str::contains("//lib:name_test: 1 passed, 0 failed"));
}

#[test]
fn invalid_filter_fails() {
  let temp = project();

  kiln_cmd()
    .arg("--root")
    .arg(temp.path())
    .args(["test", "--filter", "!"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("Invalid --filter"));
}
