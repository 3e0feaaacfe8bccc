use std::fmt;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid test selector '{selector}': {message}")]
pub struct SelectorError {
  pub selector: String,
  pub message: String,
}

/// One test case, as reported by a test tool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestCase {
  pub class_name: String,
  pub method_name: String,
}

impl TestCase {
  pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
    Self {
      class_name: class_name.into(),
      method_name: method_name.into(),
    }
  }
}

impl fmt::Display for TestCase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.class_name, self.method_name)
  }
}

/// `[!]class[#method]`. Each part is a regex searched anywhere in the name;
/// an empty part matches everything. A leading `!` excludes what matches.
#[derive(Debug, Clone)]
pub struct TestSelector {
  inclusive: bool,
  class: Option<Regex>,
  method: Option<Regex>,
}

impl TestSelector {
  pub fn parse(text: &str) -> Result<Self, SelectorError> {
    let (inclusive, body) = match text.strip_prefix('!') {
      Some(rest) => (false, rest),
      None => (true, text),
    };
    if body.is_empty() {
      return Err(SelectorError {
        selector: text.to_string(),
        message: "selector must name a class, a method, or both".to_string(),
      });
    }
    let (class, method) = match body.split_once('#') {
      Some((class, method)) => (class, method),
      None => (body, ""),
    };
    Ok(Self {
      inclusive,
      class: compile(text, class)?,
      method: compile(text, method)?,
    })
  }

  pub fn is_inclusive(&self) -> bool {
    self.inclusive
  }

  pub fn matches(&self, case: &TestCase) -> bool {
    let class_ok = self.class.as_ref().is_none_or(|re| re.is_match(&case.class_name));
    let method_ok = self.method.as_ref().is_none_or(|re| re.is_match(&case.method_name));
    class_ok && method_ok
  }

  pub fn explanation(&self) -> String {
    let mut parts = vec![if self.inclusive { "include" } else { "exclude" }.to_string()];
    if let Some(class) = &self.class {
      parts.push(format!("class:{}", class.as_str()));
    }
    if let Some(method) = &self.method {
      parts.push(format!("method:{}", method.as_str()));
    }
    parts.join(" ")
  }
}

fn compile(selector: &str, part: &str) -> Result<Option<Regex>, SelectorError> {
  if part.is_empty() {
    return Ok(None);
  }
  Regex::new(part).map(Some).map_err(|e| SelectorError {
    selector: selector.to_string(),
    message: e.to_string(),
  })
}

/// An ordered list of selectors. The first selector matching a case decides;
/// a case no selector matches is included only when every selector excludes.
#[derive(Debug, Clone, Default)]
pub struct TestSelectorList {
  selectors: Vec<TestSelector>,
}

impl TestSelectorList {
  pub fn new(selectors: Vec<TestSelector>) -> Self {
    Self { selectors }
  }

  pub fn parse<'a>(texts: impl IntoIterator<Item = &'a str>) -> Result<Self, SelectorError> {
    Ok(Self::new(texts.into_iter().map(TestSelector::parse).collect::<Result<_, _>>()?))
  }

  pub fn is_empty(&self) -> bool {
    self.selectors.is_empty()
  }

  pub fn is_included(&self, case: &TestCase) -> bool {
    match self.selectors.iter().find(|selector| selector.matches(case)) {
      Some(selector) => selector.is_inclusive(),
      None => self.selectors.iter().all(|selector| !selector.is_inclusive()),
    }
  }

  pub fn explanation(&self) -> String {
    if self.selectors.is_empty() {
      return "include everything".to_string();
    }
    self
      .selectors
      .iter()
      .map(TestSelector::explanation)
      .collect::<Vec<_>>()
      .join("; ")
  }
}
