use std::sync::Arc;

use kiln_lib::engine::{BuildEvent, RecordingListener, RuleOutcome};

use super::common::{greeting_project, load, runs, target, targets, write};

#[tokio::test]
async fn builds_dependencies_first_and_writes_outputs() {
  let dir = tempfile::tempdir().unwrap();
  greeting_project(dir.path());
  let project = load(dir.path());

  let selected = targets(&["//app:greeting"]);
  let engine = project.engine(&selected).await.unwrap();
  let summary = engine.build(&[target("//app:greeting")]).await.unwrap();

  assert!(summary.is_success(), "{summary:?}");
  assert_eq!(summary.outcomes.len(), 3);
  let output = project.root().join("kiln-out/gen/app/greeting/greeting.txt");
  assert_eq!(std::fs::read_to_string(output).unwrap(), "hello\nworld");
  assert_eq!(runs(project.root()), vec!["hello", "greeting"]);
}

#[tokio::test]
async fn unchanged_project_is_served_from_the_directory_cache() {
  let dir = tempfile::tempdir().unwrap();
  greeting_project(dir.path());
  let project = load(dir.path());
  let selected = targets(&["//app:greeting"]);

  let first = project.engine(&selected).await.unwrap();
  first.build(&[target("//app:greeting")]).await.unwrap();
  std::fs::remove_dir_all(project.root().join("kiln-out")).unwrap();

  let second = project.engine(&selected).await.unwrap();
  let summary = second.build(&[target("//app:greeting")]).await.unwrap();
  assert!(
    summary
      .outcomes
      .values()
      .all(|outcome| matches!(outcome, RuleOutcome::CacheHit { .. })),
    "{summary:?}"
  );
  assert_eq!(runs(project.root()), vec!["hello", "greeting"]);
  let output = project.root().join("kiln-out/gen/app/greeting/greeting.txt");
  assert_eq!(std::fs::read_to_string(output).unwrap(), "hello\nworld");
  assert!(project.root().join(".kiln-cache").is_dir());
}

#[tokio::test]
async fn editing_an_input_rebuilds_only_what_depends_on_it() {
  let dir = tempfile::tempdir().unwrap();
  greeting_project(dir.path());
  let selected = targets(&["//app:greeting"]);

  let project = load(dir.path());
  project
    .engine(&selected)
    .await
    .unwrap()
    .build(&[target("//app:greeting")])
    .await
    .unwrap();

  write(dir.path(), "lib/name.txt", "kiln");
  let project = load(dir.path());
  let summary = project
    .engine(&selected)
    .await
    .unwrap()
    .build(&[target("//app:greeting")])
    .await
    .unwrap();

  assert!(matches!(
    summary.outcome(&target("//lib:hello")),
    Some(RuleOutcome::CacheHit { .. })
  ));
  assert!(matches!(
    summary.outcome(&target("//lib:name.txt")),
    Some(RuleOutcome::Built { .. })
  ));
  assert!(matches!(
    summary.outcome(&target("//app:greeting")),
    Some(RuleOutcome::Built { .. })
  ));
  assert_eq!(runs(project.root()), vec!["hello", "greeting", "greeting"]);
}

#[tokio::test]
async fn uncacheable_genrule_always_runs() {
  let dir = tempfile::tempdir().unwrap();
  write(
    dir.path(),
    "stamp/BUILD.json",
    r#"[{"type": "genrule", "name": "now", "cmd": "echo run >> runs.log; date > $OUT", "out": "now.txt", "cacheable": false}]"#,
  );
  let selected = targets(&["//stamp:now"]);
  for _ in 0..2 {
    let project = load(dir.path());
    let summary = project
      .engine(&selected)
      .await
      .unwrap()
      .build(&[target("//stamp:now")])
      .await
      .unwrap();
    assert!(matches!(
      summary.outcome(&target("//stamp:now")),
      Some(RuleOutcome::Built { .. })
    ));
  }
  assert_eq!(runs(dir.path()), vec!["run", "run"]);
}

#[tokio::test]
async fn failing_command_reports_its_stderr() {
  let dir = tempfile::tempdir().unwrap();
  write(
    dir.path(),
    "bad/BUILD.json",
    r#"[{"type": "genrule", "name": "bad", "cmd": "echo 'compiler exploded' >&2; exit 7", "out": "x"}]"#,
  );
  let project = load(dir.path());
  let listener = Arc::new(RecordingListener::new());
  let summary = project
    .engine(&targets(&["//bad:bad"]))
    .await
    .unwrap()
    .with_listener(listener.clone())
    .build(&[target("//bad:bad")])
    .await
    .unwrap();

  assert_eq!(
    summary.outcome(&target("//bad:bad")),
    Some(&RuleOutcome::Failed {
      step: "genrule".to_string(),
      exit_code: 7
    })
  );
  assert!(listener.notices().iter().any(|notice| notice == "compiler exploded"));
  assert!(listener.events().iter().any(|event| matches!(
    event,
    BuildEvent::StepFinished { exit_code: 7, .. }
  )));
}
