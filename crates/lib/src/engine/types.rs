use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::rulekey::RuleKey;
use crate::target::BuildTarget;

/// How one rule ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RuleOutcome {
  /// Steps ran and succeeded.
  Built { rule_key: RuleKey },
  /// Outputs were restored from the cache; no step ran.
  CacheHit { rule_key: RuleKey },
  /// A step returned a non-zero exit code; later steps did not run.
  Failed { step: String, exit_code: i32 },
  /// The rule could not run at all.
  Error { message: String },
  /// A dependency did not succeed.
  Skipped { dependency: BuildTarget },
  Cancelled,
}

impl RuleOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, RuleOutcome::Built { .. } | RuleOutcome::CacheHit { .. })
  }

  pub fn rule_key(&self) -> Option<&RuleKey> {
    match self {
      RuleOutcome::Built { rule_key } | RuleOutcome::CacheHit { rule_key } => Some(rule_key),
      _ => None,
    }
  }
}

impl fmt::Display for RuleOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RuleOutcome::Built { .. } => f.write_str("built"),
      RuleOutcome::CacheHit { .. } => f.write_str("cache hit"),
      RuleOutcome::Failed { step, exit_code } => write!(f, "failed in step {step} (exit code {exit_code})"),
      RuleOutcome::Error { message } => write!(f, "error: {message}"),
      RuleOutcome::Skipped { dependency } => write!(f, "skipped: {dependency} did not build"),
      RuleOutcome::Cancelled => f.write_str("cancelled"),
    }
  }
}

/// Result of one engine invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildSummary {
  pub outcomes: BTreeMap<BuildTarget, RuleOutcome>,
  #[serde(with = "duration_text")]
  pub duration: Duration,
}

impl BuildSummary {
  pub fn is_success(&self) -> bool {
    self.outcomes.values().all(RuleOutcome::is_success)
  }

  pub fn outcome(&self, target: &BuildTarget) -> Option<&RuleOutcome> {
    self.outcomes.get(target)
  }

  pub fn failures(&self) -> impl Iterator<Item = (&BuildTarget, &RuleOutcome)> {
    self.outcomes.iter().filter(|(_, outcome)| !outcome.is_success())
  }

  pub fn count(&self, predicate: impl Fn(&RuleOutcome) -> bool) -> usize {
    self.outcomes.values().filter(|outcome| predicate(outcome)).count()
  }
}

mod duration_text {
  use std::time::Duration;

  use serde::Serializer;

  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
  }
}

/// Test results of one test rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRuleResult {
  /// Exit code of the test phase after normalization.
  pub exit_code: i32,
  pub passed: usize,
  pub failed: usize,
}

/// Result of `BuildEngine::run_tests`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestRunSummary {
  /// Outcome of building the tests and everything they depend on.
  pub build: BuildSummary,
  pub results: BTreeMap<BuildTarget, TestRuleResult>,
}

impl TestRunSummary {
  pub fn is_success(&self) -> bool {
    self.build.is_success() && self.results.values().all(|result| result.exit_code == 0)
  }

  /// Process exit code: the first non-zero test exit code, else 1 for a
  /// failed build, else 0.
  pub fn exit_code(&self) -> i32 {
    if let Some(result) = self.results.values().find(|result| result.exit_code != 0) {
      return result.exit_code;
    }
    if self.build.is_success() { 0 } else { 1 }
  }
}
