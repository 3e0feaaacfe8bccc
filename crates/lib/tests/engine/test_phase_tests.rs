use kiln_lib::engine::RuleOutcome;
use kiln_lib::testing::{TestRunOptions, TestSelectorList};

use super::common::{load, target, targets, write, write_executable};

/// A runner that lists `Suite/fast` and `Suite/slow` under target `T`, and
/// otherwise records its arguments, reports one passing and one failing
/// case and exits with 1.
const RUNNER: &str = r#"for arg in "$@"; do
  if [ "$arg" = "-listTestsOnly" ]; then
    echo '{"event":"begin-target","targetName":"T"}'
    echo '{"event":"begin-test","className":"Suite","methodName":"fast"}'
    echo '{"event":"end-test","className":"Suite","methodName":"fast","succeeded":true}'
    echo '{"event":"begin-test","className":"Suite","methodName":"slow"}'
    echo '{"event":"end-test","className":"Suite","methodName":"slow","succeeded":true}'
    echo '{"event":"end-target","targetName":"T"}'
    exit 0
  fi
done
echo "$@" > args.txt
echo "$T_MODE" > mode.txt
echo '{"event":"begin-target","targetName":"T"}'
echo '{"event":"end-test","className":"Suite","methodName":"fast","succeeded":true}'
echo '{"event":"end-test","className":"Suite","methodName":"slow","succeeded":false}'
echo '{"event":"end-target","targetName":"T"}'
exit 1"#;

fn test_project(root: &std::path::Path) {
  write(root, "kiln.toml", "[test]\nenv_prefix = \"T_\"\n");
  write_executable(root, "suite/run.sh", RUNNER);
  write(
    root,
    "suite/BUILD.json",
    r#"[{"type": "tool_test", "name": "suite", "runner": "run.sh", "args": ["--verbose"], "env": {"MODE": "fast"}}]"#,
  );
}

#[tokio::test]
async fn test_phase_runs_the_tool_and_counts_results() {
  let dir = tempfile::tempdir().unwrap();
  test_project(dir.path());
  let project = load(dir.path());
  let options = TestRunOptions::from_config(&project.config().test, TestSelectorList::default());

  let engine = project.engine(&targets(&["//suite:suite"])).await.unwrap();
  let summary = engine.run_tests(&[target("//suite:suite")], &options).await.unwrap();

  assert!(matches!(
    summary.build.outcome(&target("//suite:suite")),
    Some(RuleOutcome::Built { .. })
  ));
  let result = &summary.results[&target("//suite:suite")];
  assert_eq!((result.exit_code, result.passed, result.failed), (0, 1, 1));
  assert_eq!(std::fs::read_to_string(project.root().join("args.txt")).unwrap(), "--verbose\n");
  assert_eq!(std::fs::read_to_string(project.root().join("mode.txt")).unwrap(), "fast\n");
  assert!(project.root().join("kiln-out/test/suite/suite/results.jsonl").is_file());
}

#[tokio::test]
async fn selectors_narrow_the_run_to_matching_cases() {
  let dir = tempfile::tempdir().unwrap();
  test_project(dir.path());
  let project = load(dir.path());
  let selectors = TestSelectorList::parse(["Suite#fast"]).unwrap();
  let options = TestRunOptions::from_config(&project.config().test, selectors);

  let engine = project.engine(&targets(&["//suite:suite"])).await.unwrap();
  let summary = engine.run_tests(&[target("//suite:suite")], &options).await.unwrap();

  assert_eq!(summary.exit_code(), 0);
  assert_eq!(
    std::fs::read_to_string(project.root().join("args.txt")).unwrap(),
    "--verbose -only T:Suite/fast\n"
  );
  assert!(project.root().join("kiln-out/test/suite/suite/results.list.jsonl").is_file());
}

#[tokio::test]
async fn selector_matching_nothing_skips_the_run() {
  let dir = tempfile::tempdir().unwrap();
  test_project(dir.path());
  let project = load(dir.path());
  let selectors = TestSelectorList::parse(["Nope"]).unwrap();
  let options = TestRunOptions::from_config(&project.config().test, selectors);

  let engine = project.engine(&targets(&["//suite:suite"])).await.unwrap();
  let summary = engine.run_tests(&[target("//suite:suite")], &options).await.unwrap();

  let result = &summary.results[&target("//suite:suite")];
  assert_eq!((result.exit_code, result.passed, result.failed), (0, 0, 0));
  assert!(!project.root().join("args.txt").exists());
}
