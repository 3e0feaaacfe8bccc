//! The build engine.
//!
//! Rules run on a bounded pool once every dependency has finished. Each rule
//! computes its key, tries the artifact cache and only runs its steps on a
//! miss. A failed rule skips its dependents; without `keep_going` nothing new
//! is started after the first failure. Cancellation stops dispatch, lets
//! in-flight steps observe the signal and drains them before returning.

pub mod cancel;
pub mod events;
pub mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::BufReader;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::{Artifact, ArtifactCache};
use crate::config::KilnConfig;
use crate::rulekey::{RuleKey, RuleKeyError, RuleKeyFactory};
use crate::rules::{BuildRule, BuildRuleResolver};
use crate::step::{ExecutionContext, StepError, run_steps};
use crate::target::BuildTarget;
use crate::testing::{TestResultCollector, TestRunOptions, parse_event_stream};
use crate::throttle::StutterGate;

pub use cancel::Cancellation;
pub use events::{BuildEvent, BuildEventListener, LoggingListener, NoticeLevel, RecordingListener};
pub use types::{BuildSummary, RuleOutcome, TestRuleResult, TestRunSummary};

/// Ambient variables every step sees.
pub const INHERITED_ENV: &[&str] = &["PATH", "HOME", "TMPDIR", "LANG"];

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("no build rule for {target}")]
  NoRule { target: BuildTarget },

  #[error("{target} is not a test")]
  NotATest { target: BuildTarget },

  #[error(transparent)]
  RuleKey(#[from] RuleKeyError),

  #[error("test phase of {target} failed: {source}")]
  Step {
    target: BuildTarget,
    #[source]
    source: StepError,
  },

  #[error("task for {target} panicked: {message}")]
  Panicked { target: BuildTarget, message: String },

  #[error("build cancelled")]
  Cancelled,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Maximum number of rules running at once.
  pub threads: usize,
  pub keep_going: bool,
  pub stutter_timeout: Option<Duration>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self::from_config(&KilnConfig::default())
  }
}

impl EngineConfig {
  pub fn from_config(config: &KilnConfig) -> Self {
    Self {
      threads: config.build.threads.max(1),
      keep_going: config.build.keep_going,
      stutter_timeout: config.test.stutter_timeout,
    }
  }
}

/// State one rule task needs; cheap to clone into a spawned task.
#[derive(Clone)]
struct Worker {
  resolver: Arc<BuildRuleResolver>,
  keys: Arc<RuleKeyFactory>,
  cache: Arc<dyn ArtifactCache>,
  context: ExecutionContext,
}

pub struct BuildEngine {
  worker: Worker,
  config: EngineConfig,
}

impl BuildEngine {
  pub fn new(resolver: Arc<BuildRuleResolver>, cache: Arc<dyn ArtifactCache>, config: EngineConfig) -> Self {
    let context = ExecutionContext::new(resolver.context().project_root())
      .with_inherited_env(INHERITED_ENV.iter().copied())
      .with_stutter_gate(Arc::new(StutterGate::new(config.stutter_timeout)));
    Self {
      worker: Worker {
        resolver,
        keys: Arc::new(RuleKeyFactory::new()),
        cache,
        context,
      },
      config,
    }
  }

  pub fn with_listener(mut self, listener: Arc<dyn BuildEventListener>) -> Self {
    self.worker.context = self.worker.context.with_listener(listener);
    self
  }

  pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
    self.worker.context = self.worker.context.with_cancellation(cancellation);
    self
  }

  pub fn cancellation(&self) -> &Cancellation {
    &self.worker.context.cancellation
  }

  pub fn resolver(&self) -> &BuildRuleResolver {
    &self.worker.resolver
  }

  pub fn rule_key(&self, target: &BuildTarget) -> Result<RuleKey, EngineError> {
    let rule = self.rule(target)?;
    Ok(self.worker.keys.compute(rule.as_ref(), &self.worker.resolver)?)
  }

  fn rule(&self, target: &BuildTarget) -> Result<&Arc<dyn BuildRule>, EngineError> {
    self
      .worker
      .resolver
      .get(target)
      .ok_or_else(|| EngineError::NoRule { target: target.clone() })
  }

  /// `targets` and every rule they depend on.
  fn closure(&self, targets: &[BuildTarget]) -> Result<BTreeSet<BuildTarget>, EngineError> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<BuildTarget> = targets.to_vec();
    while let Some(target) = stack.pop() {
      if seen.contains(&target) {
        continue;
      }
      let rule = self.rule(&target)?;
      stack.extend(rule.deps().iter().filter(|dep| !seen.contains(*dep)).cloned());
      seen.insert(target);
    }
    Ok(seen)
  }

  /// Build `targets` and their dependencies.
  pub async fn build(&self, targets: &[BuildTarget]) -> Result<BuildSummary, EngineError> {
    let started = Instant::now();
    let closure = self.closure(targets)?;
    info!(requested = targets.len(), rules = closure.len(), threads = self.config.threads, "starting build");

    let mut waiting: BTreeMap<BuildTarget, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<BuildTarget, Vec<BuildTarget>> = BTreeMap::new();
    for target in &closure {
      let deps = self.rule(target)?.deps();
      waiting.insert(target.clone(), deps.len());
      for dep in deps {
        dependents.entry(dep.clone()).or_default().push(target.clone());
      }
    }
    let mut ready: VecDeque<BuildTarget> = waiting
      .iter()
      .filter(|(_, count)| **count == 0)
      .map(|(target, _)| target.clone())
      .collect();

    let cancel = self.cancellation().clone();
    let semaphore = Arc::new(Semaphore::new(self.config.threads.max(1)));
    let mut tasks = JoinSet::new();
    let mut running: HashMap<tokio::task::Id, BuildTarget> = HashMap::new();
    let mut summary = BuildSummary::default();
    let mut halted_by: Option<BuildTarget> = None;
    // Set by the failing rule while it still holds its slot, so a rule that
    // gets the slot afterwards sees it before starting.
    let halt = (!self.config.keep_going).then(|| Arc::new(AtomicBool::new(false)));

    loop {
      if halted_by.is_none() && !cancel.is_cancelled() {
        while let Some(target) = ready.pop_front() {
          let rule = Arc::clone(self.rule(&target)?);
          let worker = self.worker.clone();
          let semaphore = Arc::clone(&semaphore);
          let halt = halt.clone();
          let handle = tasks.spawn(async move { worker.run_rule(rule, semaphore, halt).await });
          running.insert(handle.id(), target);
        }
      }

      let Some(joined) = tasks.join_next_with_id().await else {
        break;
      };
      let (target, outcome) = match joined {
        Ok((id, outcome)) => (running.remove(&id), outcome),
        Err(e) => {
          let target = running.remove(&e.id());
          error!(error = %e, target = ?target.as_ref().map(ToString::to_string), "rule task panicked");
          let message = if e.is_cancelled() { "task aborted" } else { "task panicked" };
          (target, Some(RuleOutcome::Error { message: message.to_string() }))
        }
      };
      let Some(target) = target else {
        continue;
      };
      // Never started because the build halted; reported as skipped below.
      let Some(outcome) = outcome else {
        debug!(target = %target, "not starting rule after failure");
        continue;
      };

      if outcome.is_success() {
        for dependent in dependents.get(&target).into_iter().flatten() {
          if let Some(count) = waiting.get_mut(dependent) {
            *count -= 1;
            if *count == 0 && !summary.outcomes.contains_key(dependent) {
              ready.push_back(dependent.clone());
            }
          }
        }
      } else if outcome != RuleOutcome::Cancelled {
        self.skip_dependents(&target, &dependents, &mut summary);
        if !self.config.keep_going && halted_by.is_none() {
          warn!(target = %target, "stopping build after failure");
          halted_by = Some(target.clone());
        }
      }
      summary.outcomes.insert(target, outcome);
    }

    for target in closure {
      if summary.outcomes.contains_key(&target) {
        continue;
      }
      let outcome = match &halted_by {
        Some(failed) if !cancel.is_cancelled() => RuleOutcome::Skipped {
          dependency: failed.clone(),
        },
        _ => RuleOutcome::Cancelled,
      };
      summary.outcomes.insert(target, outcome);
    }

    summary.duration = started.elapsed();
    if cancel.is_cancelled() {
      warn!("build cancelled");
      return Err(EngineError::Cancelled);
    }
    info!(
      rules = summary.outcomes.len(),
      built = summary.count(|o| matches!(o, RuleOutcome::Built { .. })),
      cached = summary.count(|o| matches!(o, RuleOutcome::CacheHit { .. })),
      failed = summary.failures().count(),
      duration = %humantime::format_duration(summary.duration),
      "build finished"
    );
    Ok(summary)
  }

  /// Mark every transitive dependent of `failed` that has no outcome yet.
  fn skip_dependents(
    &self,
    failed: &BuildTarget,
    dependents: &BTreeMap<BuildTarget, Vec<BuildTarget>>,
    summary: &mut BuildSummary,
  ) {
    let mut stack: Vec<&BuildTarget> = dependents.get(failed).into_iter().flatten().collect();
    while let Some(dependent) = stack.pop() {
      if summary.outcomes.contains_key(dependent) {
        continue;
      }
      let outcome = RuleOutcome::Skipped {
        dependency: failed.clone(),
      };
      debug!(target = %dependent, dependency = %failed, "skipping dependent of failed rule");
      self.worker.context.post(BuildEvent::RuleFinished {
        target: dependent.clone(),
        outcome: outcome.clone(),
      });
      summary.outcomes.insert(dependent.clone(), outcome);
      stack.extend(dependents.get(dependent).into_iter().flatten());
    }
  }

  /// Build `targets`, then run the test phase of those that are tests and
  /// built successfully.
  pub async fn run_tests(&self, targets: &[BuildTarget], options: &TestRunOptions) -> Result<TestRunSummary, EngineError> {
    let build = self.build(targets).await?;
    let mut summary = TestRunSummary {
      build,
      results: BTreeMap::new(),
    };

    let options = Arc::new(options.clone());
    let semaphore = Arc::new(Semaphore::new(self.config.threads.max(1)));
    let mut tasks = JoinSet::new();
    let mut running: HashMap<tokio::task::Id, BuildTarget> = HashMap::new();
    for target in targets {
      let rule = self.rule(target)?;
      if rule.as_test_rule().is_none() {
        continue;
      }
      if !summary.build.outcome(target).is_some_and(RuleOutcome::is_success) {
        debug!(target = %target, "not running test whose build failed");
        continue;
      }
      let rule = Arc::clone(rule);
      let worker = self.worker.clone();
      let options = Arc::clone(&options);
      let semaphore = Arc::clone(&semaphore);
      let handle = tasks.spawn(async move { worker.run_test(rule, &options, semaphore).await });
      running.insert(handle.id(), target.clone());
    }

    while let Some(joined) = tasks.join_next_with_id().await {
      match joined {
        Ok((id, Ok(result))) => {
          let Some(target) = running.remove(&id) else {
            continue;
          };
          info!(target = %target, exit_code = result.exit_code, passed = result.passed, failed = result.failed, "test finished");
          summary.results.insert(target, result);
        }
        Ok((_, Err(e))) => {
          tasks.abort_all();
          return Err(e);
        }
        Err(e) => {
          error!(error = %e, "test task panicked");
          let Some(target) = running.remove(&e.id()) else {
            continue;
          };
          tasks.abort_all();
          return Err(EngineError::Panicked {
            target,
            message: e.to_string(),
          });
        }
      }
    }

    if self.cancellation().is_cancelled() {
      return Err(EngineError::Cancelled);
    }
    Ok(summary)
  }
}

impl Worker {
  /// Wait for a slot, or for cancellation.
  async fn acquire(&self, semaphore: Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
      biased;
      _ = self.context.cancellation.cancelled() => None,
      permit = semaphore.acquire_owned() => permit.ok(),
    }
  }

  /// Run one rule once a slot is free. `None` means the rule was never
  /// started because `halt` was set while it waited.
  async fn run_rule(
    &self,
    rule: Arc<dyn BuildRule>,
    semaphore: Arc<Semaphore>,
    halt: Option<Arc<AtomicBool>>,
  ) -> Option<RuleOutcome> {
    let Some(_permit) = self.acquire(semaphore).await else {
      return Some(RuleOutcome::Cancelled);
    };
    if halt.as_ref().is_some_and(|halt| halt.load(Ordering::SeqCst)) {
      return None;
    }
    let ctx = self.context.for_target(rule.target());
    ctx.post(BuildEvent::RuleStarted {
      target: rule.target().clone(),
    });
    let outcome = self.build_rule(rule.as_ref(), &ctx).await;
    if let Some(halt) = &halt
      && !outcome.is_success()
      && outcome != RuleOutcome::Cancelled
    {
      halt.store(true, Ordering::SeqCst);
    }
    ctx.post(BuildEvent::RuleFinished {
      target: rule.target().clone(),
      outcome: outcome.clone(),
    });
    Some(outcome)
  }

  async fn build_rule(&self, rule: &dyn BuildRule, ctx: &ExecutionContext) -> RuleOutcome {
    let target = rule.target();
    let rule_key = match self.keys.compute(rule, &self.resolver) {
      Ok(key) => key,
      Err(e) => {
        error!(target = %target, error = %e, "failed to compute rule key");
        return RuleOutcome::Error { message: e.to_string() };
      }
    };

    if rule.is_cacheable() {
      match self.cache.lookup(&rule_key).await {
        Ok(Some(artifact)) => match artifact.materialize(&ctx.project_root) {
          Ok(()) => {
            debug!(target = %target, rule_key = %rule_key, files = artifact.len(), "restored from cache");
            return RuleOutcome::CacheHit { rule_key };
          }
          Err(e) => warn!(target = %target, error = %e, "failed to restore cached outputs, building"),
        },
        Ok(None) => {}
        Err(e) => warn!(target = %target, error = %e, "cache lookup failed, building"),
      }
    }

    match run_steps(&rule.build_steps(), ctx).await {
      Ok(None) => {}
      Ok(Some((step, exit_code))) => return RuleOutcome::Failed { step, exit_code },
      Err(e) if e.is_cancellation() => return RuleOutcome::Cancelled,
      Err(e) => {
        error!(target = %target, error = %e, "rule failed");
        return RuleOutcome::Error { message: e.to_string() };
      }
    }

    let outputs = rule.outputs();
    if let Some(missing) = outputs.iter().find(|output| !ctx.resolve(output).exists()) {
      return RuleOutcome::Error {
        message: format!("rule output {} was not produced", missing.display()),
      };
    }

    if rule.is_cacheable() && !outputs.is_empty() {
      self.store(target, &rule_key, &ctx.project_root, &outputs).await;
    }
    RuleOutcome::Built { rule_key }
  }

  /// A failed store never fails the rule.
  async fn store(&self, target: &BuildTarget, rule_key: &RuleKey, project_root: &Path, outputs: &[std::path::PathBuf]) {
    let artifact = match Artifact::collect(project_root, outputs) {
      Ok(artifact) => artifact,
      Err(e) => {
        warn!(target = %target, error = %e, "failed to collect outputs for caching");
        return;
      }
    };
    if let Err(e) = self.cache.store(rule_key, &artifact).await {
      warn!(target = %target, error = %e, "failed to store outputs in cache");
    }
  }

  async fn run_test(
    &self,
    rule: Arc<dyn BuildRule>,
    options: &TestRunOptions,
    semaphore: Arc<Semaphore>,
  ) -> Result<TestRuleResult, EngineError> {
    let target = rule.target().clone();
    let Some(test) = rule.as_test_rule() else {
      return Err(EngineError::NotATest { target });
    };
    let Some(_permit) = self.acquire(semaphore).await else {
      return Err(EngineError::Cancelled);
    };
    let ctx = self.context.for_target(&target);

    let exit_code = match run_steps(&test.test_steps(options), &ctx).await {
      Ok(None) => 0,
      Ok(Some((_, exit_code))) => exit_code,
      Err(e) if e.is_cancellation() => return Err(EngineError::Cancelled),
      Err(source) => return Err(EngineError::Step { target, source }),
    };

    let results = read_results(&ctx.resolve(&test.results_path())).await;
    Ok(TestRuleResult {
      exit_code,
      passed: results.passed,
      failed: results.failed.len(),
    })
  }
}

/// Counts from a results file. A missing or truncated file counts what it has.
async fn read_results(path: &Path) -> TestResultCollector {
  let mut collector = TestResultCollector::new();
  let file = match tokio::fs::File::open(path).await {
    Ok(file) => file,
    Err(e) => {
      debug!(path = ?path, error = %e, "no test results");
      return collector;
    }
  };
  if let Err(e) = parse_event_stream(BufReader::new(file), &mut collector).await {
    debug!(path = ?path, error = %e, "test results are incomplete");
  }
  collector
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{InMemoryArtifactCache, NoopArtifactCache};
  use crate::graph::TargetGraph;
  use crate::rules::RuleContext;
  use crate::util::testutil::{graph_from, t, write_file};
  use serde_json::json;

  async fn engine(root: &Path, graph: &TargetGraph, cache: Arc<dyn ArtifactCache>, keep_going: bool) -> BuildEngine {
    let resolver = BuildRuleResolver::from_target_graph(graph, &RuleContext::for_root(root))
      .await
      .unwrap();
    let config = EngineConfig {
      threads: 4,
      keep_going,
      stutter_timeout: None,
    };
    BuildEngine::new(Arc::new(resolver), cache, config)
  }

  fn chain() -> TargetGraph {
    graph_from(&[
      ("lib", json!({"type": "export_file", "name": "a.txt", "visibility": ["PUBLIC"]})),
      (
        "app",
        json!({
          "type": "genrule",
          "name": "upper",
          "srcs": ["//lib:a.txt"],
          "cmd": "tr a-z A-Z < $SRCS > $OUT",
          "out": "upper.txt",
        }),
      ),
    ])
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn second_build_is_served_from_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "lib/a.txt", "hello");
    let cache: Arc<dyn ArtifactCache> = Arc::new(InMemoryArtifactCache::new());
    let graph = chain();

    let first = engine(dir.path(), &graph, Arc::clone(&cache), true)
      .await
      .build(&[t("//app:upper")])
      .await
      .unwrap();
    assert!(first.is_success());
    assert!(matches!(first.outcome(&t("//app:upper")), Some(RuleOutcome::Built { .. })));
    let out = dir.path().join("kiln-out/gen/app/upper/upper.txt");
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "HELLO");

    std::fs::remove_dir_all(dir.path().join("kiln-out")).unwrap();
    let second = engine(dir.path(), &graph, cache, true)
      .await
      .build(&[t("//app:upper")])
      .await
      .unwrap();
    assert!(matches!(second.outcome(&t("//app:upper")), Some(RuleOutcome::CacheHit { .. })));
    assert!(matches!(second.outcome(&t("//lib:a.txt")), Some(RuleOutcome::CacheHit { .. })));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "HELLO");
    assert_eq!(
      first.outcome(&t("//app:upper")).unwrap().rule_key(),
      second.outcome(&t("//app:upper")).unwrap().rule_key()
    );
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn changed_input_rebuilds() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "lib/a.txt", "one");
    let cache: Arc<dyn ArtifactCache> = Arc::new(InMemoryArtifactCache::new());
    let graph = chain();
    engine(dir.path(), &graph, Arc::clone(&cache), true)
      .await
      .build(&[t("//app:upper")])
      .await
      .unwrap();

    std::fs::write(dir.path().join("lib/a.txt"), "two").unwrap();
    let summary = engine(dir.path(), &graph, cache, true)
      .await
      .build(&[t("//app:upper")])
      .await
      .unwrap();
    assert!(matches!(summary.outcome(&t("//app:upper")), Some(RuleOutcome::Built { .. })));
    let out = dir.path().join("kiln-out/gen/app/upper/upper.txt");
    assert_eq!(std::fs::read_to_string(out).unwrap(), "TWO");
  }

  fn failing_project() -> TargetGraph {
    graph_from(&[
      ("a", json!({"type": "genrule", "name": "broken", "cmd": "exit 3", "out": "o", "visibility": ["PUBLIC"]})),
      (
        "b",
        json!({"type": "genrule", "name": "user", "cmd": "cat $(location //a:broken) > $OUT", "out": "o"}),
      ),
      ("c", json!({"type": "genrule", "name": "fine", "cmd": "echo ok > $OUT", "out": "o"})),
    ])
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn failure_skips_dependents_and_keeps_going() {
    let dir = tempfile::tempdir().unwrap();
    let graph = failing_project();
    let listener = Arc::new(RecordingListener::new());
    let summary = engine(dir.path(), &graph, Arc::new(NoopArtifactCache), true)
      .await
      .with_listener(listener.clone())
      .build(&[t("//b:user"), t("//c:fine")])
      .await
      .unwrap();

    assert!(!summary.is_success());
    assert_eq!(
      summary.outcome(&t("//a:broken")),
      Some(&RuleOutcome::Failed {
        step: "genrule".to_string(),
        exit_code: 3
      })
    );
    assert_eq!(
      summary.outcome(&t("//b:user")),
      Some(&RuleOutcome::Skipped { dependency: t("//a:broken") })
    );
    assert!(matches!(summary.outcome(&t("//c:fine")), Some(RuleOutcome::Built { .. })));

    let started: Vec<BuildTarget> = listener
      .events()
      .into_iter()
      .filter_map(|event| match event {
        BuildEvent::RuleStarted { target } => Some(target),
        _ => None,
      })
      .collect();
    assert!(!started.contains(&t("//b:user")));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn failure_without_keep_going_skips_waiting_rules() {
    let dir = tempfile::tempdir().unwrap();
    let graph = failing_project();
    let resolver = BuildRuleResolver::from_target_graph(&graph, &RuleContext::for_root(dir.path()))
      .await
      .unwrap();
    let config = EngineConfig {
      threads: 1,
      keep_going: false,
      stutter_timeout: None,
    };
    let listener = Arc::new(RecordingListener::new());
    let summary = BuildEngine::new(Arc::new(resolver), Arc::new(NoopArtifactCache), config)
      .with_listener(listener.clone())
      .build(&[t("//a:broken"), t("//c:fine")])
      .await
      .unwrap();

    assert_eq!(
      summary.outcome(&t("//a:broken")),
      Some(&RuleOutcome::Failed {
        step: "genrule".to_string(),
        exit_code: 3
      })
    );
    assert_eq!(
      summary.outcome(&t("//c:fine")),
      Some(&RuleOutcome::Skipped { dependency: t("//a:broken") })
    );
    assert!(!listener.events().contains(&BuildEvent::RuleStarted { target: t("//c:fine") }));
    assert!(!dir.path().join("kiln-out/gen/c/fine/o").exists());
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn dependencies_finish_before_dependents_start() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "lib/a.txt", "x");
    let graph = chain();
    let listener = Arc::new(RecordingListener::new());
    engine(dir.path(), &graph, Arc::new(NoopArtifactCache), true)
      .await
      .with_listener(listener.clone())
      .build(&[t("//app:upper")])
      .await
      .unwrap();

    let events = listener.events();
    let position = |wanted: &BuildEvent| events.iter().position(|event| event == wanted).unwrap();
    let dep_finished = events
      .iter()
      .position(|event| matches!(event, BuildEvent::RuleFinished { target, .. } if *target == t("//lib:a.txt")))
      .unwrap();
    let dependent_started = position(&BuildEvent::RuleStarted {
      target: t("//app:upper"),
    });
    assert!(dep_finished < dependent_started);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn missing_output_fails_the_rule() {
    let dir = tempfile::tempdir().unwrap();
    let graph = graph_from(&[("a", json!({"type": "genrule", "name": "lazy", "cmd": "true", "out": "never"}))]);
    let summary = engine(dir.path(), &graph, Arc::new(NoopArtifactCache), true)
      .await
      .build(&[t("//a:lazy")])
      .await
      .unwrap();
    assert_eq!(
      summary.outcome(&t("//a:lazy")),
      Some(&RuleOutcome::Error {
        message: "rule output kiln-out/gen/a/lazy/never was not produced".to_string()
      })
    );
  }

  #[tokio::test]
  async fn unknown_target_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let graph = chain();
    let err = engine(dir.path(), &graph, Arc::new(NoopArtifactCache), true)
      .await
      .build(&[t("//nope:nope")])
      .await
      .unwrap_err();
    assert_eq!(err.to_string(), "no build rule for //nope:nope");
  }

  #[tokio::test]
  async fn cancelled_build_reports_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "lib/a.txt", "x");
    let graph = chain();
    let engine = engine(dir.path(), &graph, Arc::new(NoopArtifactCache), true).await;
    engine.cancellation().cancel();
    let err = engine.build(&[t("//app:upper")]).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_phase_reports_counts_and_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    crate::util::testutil::write_fake_test_tool(dir.path(), 1);
    let graph = graph_from(&[(
      "tools",
      json!({"type": "tool_test", "name": "fake", "runner": "fake-test-tool"}),
    )]);
    let engine = engine(dir.path(), &graph, Arc::new(NoopArtifactCache), true).await;
    let summary = engine
      .run_tests(&[t("//tools:fake")], &TestRunOptions::default())
      .await
      .unwrap();

    assert_eq!(
      summary.results.get(&t("//tools:fake")),
      Some(&TestRuleResult {
        exit_code: 0,
        passed: 0,
        failed: 1
      })
    );
    assert_eq!(summary.exit_code(), 0);
    assert!(dir.path().join("kiln-out/test/tools/fake/results.jsonl").exists());
  }
}
