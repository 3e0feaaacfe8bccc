//! Running external test tools.
//!
//! Test tools report results as a line-oriented JSON event stream. Selectors
//! narrow a run to matching cases; the runner step lists the cases first and
//! passes the selected ones back to the tool as filter arguments.

pub mod events;
pub mod runner;
pub mod selector;

use std::collections::BTreeMap;

use crate::config::TestSection;

pub use events::{ListTestsHandler, ProtocolError, TestEvent, TestEventHandler, TestResultCollector, format_filter_params, parse_event_stream};
pub use runner::TestRunnerStep;
pub use selector::{SelectorError, TestCase, TestSelector, TestSelectorList};

/// Settings for one `kiln test` invocation.
#[derive(Debug, Clone)]
pub struct TestRunOptions {
  pub selectors: TestSelectorList,
  pub list_flag: String,
  pub filter_flag: String,
  /// Prefix applied to every per-test environment variable name.
  pub env_prefix: Option<String>,
}

impl Default for TestRunOptions {
  fn default() -> Self {
    Self::from_config(&TestSection::default(), TestSelectorList::default())
  }
}

impl TestRunOptions {
  pub fn from_config(section: &TestSection, selectors: TestSelectorList) -> Self {
    Self {
      selectors,
      list_flag: section.list_flag.clone(),
      filter_flag: section.filter_flag.clone(),
      env_prefix: section.env_prefix.clone(),
    }
  }

  /// Apply the configured prefix to each variable name.
  pub fn prefixed_env(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let prefix = self.env_prefix.as_deref().unwrap_or("");
    env.iter().map(|(k, v)| (format!("{prefix}{k}"), v.clone())).collect()
  }
}
