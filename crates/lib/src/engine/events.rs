use std::sync::Mutex;

use serde::Serialize;
use tracing::{error, info, warn};

use super::types::RuleOutcome;
use crate::target::BuildTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
  Info,
  Warning,
  Error,
}

/// Progress reported by the engine. Steps outside a rule carry no target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BuildEvent {
  RuleStarted {
    target: BuildTarget,
  },
  RuleFinished {
    target: BuildTarget,
    outcome: RuleOutcome,
  },
  StepStarted {
    target: Option<BuildTarget>,
    short_name: String,
    description: String,
  },
  StepFinished {
    target: Option<BuildTarget>,
    short_name: String,
    exit_code: i32,
  },
  Notice {
    target: Option<BuildTarget>,
    level: NoticeLevel,
    message: String,
  },
}

pub trait BuildEventListener: Send + Sync {
  fn on_event(&self, event: &BuildEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl BuildEventListener for LoggingListener {
  fn on_event(&self, event: &BuildEvent) {
    match event {
      BuildEvent::RuleStarted { target } => info!(target = %target, "rule started"),
      BuildEvent::RuleFinished { target, outcome } => info!(target = %target, outcome = %outcome, "rule finished"),
      BuildEvent::StepStarted {
        target,
        short_name,
        description,
      } => info!(target = ?target.as_ref().map(ToString::to_string), step = %short_name, %description, "step started"),
      BuildEvent::StepFinished {
        target,
        short_name,
        exit_code,
      } => info!(target = ?target.as_ref().map(ToString::to_string), step = %short_name, exit_code, "step finished"),
      BuildEvent::Notice { level, message, .. } => match level {
        NoticeLevel::Info => info!("{message}"),
        NoticeLevel::Warning => warn!("{message}"),
        NoticeLevel::Error => error!("{message}"),
      },
    }
  }
}

/// Keeps every event, in order.
#[derive(Debug, Default)]
pub struct RecordingListener {
  events: Mutex<Vec<BuildEvent>>,
}

impl RecordingListener {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<BuildEvent> {
    self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
  }

  pub fn notices(&self) -> Vec<String> {
    self
      .events()
      .into_iter()
      .filter_map(|event| match event {
        BuildEvent::Notice { message, .. } => Some(message),
        _ => None,
      })
      .collect()
  }
}

impl BuildEventListener for RecordingListener {
  fn on_event(&self, event: &BuildEvent) {
    self
      .events
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .push(event.clone());
  }
}
