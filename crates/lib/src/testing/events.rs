//! The structured test event stream.
//!
//! Test tools print one JSON object per line. Each carries an `event` tag:
//! `begin-target`/`end-target` scope a test target, `begin-suite`/`end-suite`
//! scope a suite and `begin-test`/`end-test` scope one case. Unknown events
//! are ignored.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::selector::{TestCase, TestSelectorList};

#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error("line {line}: malformed test event: {message}")]
  Malformed { line: usize, message: String },

  #[error("test {case} began outside of any test target")]
  CaseOutsideTarget { case: String },

  #[error("test target {found} began while {open} was still open")]
  NestedTarget { open: String, found: String },

  #[error("end of test target {found} does not match open target {expected}")]
  MismatchedEnd { expected: String, found: String },

  #[error("event stream ended inside test target {open}")]
  Unterminated { open: String },

  #[error("failed to read test events: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TestEvent {
  BeginTarget {
    target_name: String,
  },
  EndTarget {
    target_name: String,
  },
  BeginSuite {
    suite: String,
  },
  EndSuite {
    suite: String,
  },
  BeginTest {
    class_name: String,
    method_name: String,
  },
  EndTest {
    class_name: String,
    method_name: String,
    #[serde(default)]
    succeeded: bool,
  },
  #[serde(other)]
  Other,
}

pub trait TestEventHandler {
  fn handle(&mut self, event: TestEvent) -> Result<(), ProtocolError>;

  /// Called once the stream ends.
  fn finish(&mut self) -> Result<(), ProtocolError> {
    Ok(())
  }
}

/// Feed every event of `reader` to `handler`, stopping at the first error.
pub async fn parse_event_stream<R, H>(reader: R, handler: &mut H) -> Result<(), ProtocolError>
where
  R: AsyncBufRead + Unpin,
  H: TestEventHandler + ?Sized,
{
  let mut lines = reader.lines();
  let mut line_number = 0;
  while let Some(line) = lines.next_line().await? {
    line_number += 1;
    let line = line.trim();
    if line.is_empty() {
      continue;
    }
    let event: TestEvent = serde_json::from_str(line).map_err(|e| ProtocolError::Malformed {
      line: line_number,
      message: e.to_string(),
    })?;
    handler.handle(event)?;
  }
  handler.finish()
}

/// Collects the cases of a list-only run, grouped by target in stream order.
#[derive(Debug, Default)]
pub struct ListTestsHandler {
  open: Option<String>,
  targets: Vec<(String, Vec<TestCase>)>,
}

impl ListTestsHandler {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn into_targets(self) -> Vec<(String, Vec<TestCase>)> {
    self.targets
  }
}

impl TestEventHandler for ListTestsHandler {
  fn handle(&mut self, event: TestEvent) -> Result<(), ProtocolError> {
    match event {
      TestEvent::BeginTarget { target_name } => {
        if let Some(open) = &self.open {
          return Err(ProtocolError::NestedTarget {
            open: open.clone(),
            found: target_name,
          });
        }
        if !self.targets.iter().any(|(name, _)| *name == target_name) {
          self.targets.push((target_name.clone(), Vec::new()));
        }
        self.open = Some(target_name);
      }
      TestEvent::EndTarget { target_name } => match self.open.take() {
        Some(open) if open == target_name => {}
        open => {
          return Err(ProtocolError::MismatchedEnd {
            expected: open.unwrap_or_else(|| "<none>".to_string()),
            found: target_name,
          });
        }
      },
      TestEvent::BeginTest {
        class_name,
        method_name,
      } => {
        let case = TestCase::new(class_name, method_name);
        let Some(open) = &self.open else {
          return Err(ProtocolError::CaseOutsideTarget { case: case.to_string() });
        };
        if let Some((_, cases)) = self.targets.iter_mut().find(|(name, _)| name == open)
          && !cases.contains(&case)
        {
          cases.push(case);
        }
      }
      _ => {}
    }
    Ok(())
  }

  fn finish(&mut self) -> Result<(), ProtocolError> {
    match self.open.take() {
      Some(open) => Err(ProtocolError::Unterminated { open }),
      None => Ok(()),
    }
  }
}

/// Counts finished cases of a real run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TestResultCollector {
  pub passed: usize,
  pub failed: Vec<TestCase>,
}

impl TestResultCollector {
  pub fn new() -> Self {
    Self::default()
  }
}

impl TestEventHandler for TestResultCollector {
  fn handle(&mut self, event: TestEvent) -> Result<(), ProtocolError> {
    if let TestEvent::EndTest {
      class_name,
      method_name,
      succeeded,
    } = event
    {
      if succeeded {
        self.passed += 1;
      } else {
        self.failed.push(TestCase::new(class_name, method_name));
      }
    }
    Ok(())
  }
}

/// For each target with at least one selected case, `filter_flag` followed by
/// `TARGET:Class/method,Class/method`.
pub fn format_filter_params(
  targets: &[(String, Vec<TestCase>)],
  selectors: &TestSelectorList,
  filter_flag: &str,
) -> Vec<String> {
  let mut params = Vec::new();
  for (target, cases) in targets {
    let selected: Vec<String> = cases
      .iter()
      .filter(|case| selectors.is_included(case))
      .map(ToString::to_string)
      .collect();
    if !selected.is_empty() {
      params.push(filter_flag.to_string());
      params.push(format!("{target}:{}", selected.join(",")));
    }
  }
  params
}
