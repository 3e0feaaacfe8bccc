//! Everything kiln prints to the terminal.
//!
//! Status lines carry a [`Tone`] that picks their marker, color and stream.
//! `--output json` bypasses all of it through [`emit_json`].

use std::fmt::Display;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use kiln_lib::engine::{BuildEvent, BuildEventListener, NoticeLevel, RuleOutcome};
use kiln_lib::rulekey::RuleKey;
use kiln_lib::target::BuildTarget;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
  Success,
  Cached,
  Info,
  Warning,
  Skipped,
  Error,
}

impl Tone {
  fn marker(self) -> &'static str {
    match self {
      Tone::Success => "✓",
      Tone::Cached => "↺",
      Tone::Info => "•",
      Tone::Warning => "⚠",
      Tone::Skipped => "-",
      Tone::Error => "✗",
    }
  }

  /// Problems go to stderr so stdout stays parseable.
  fn stream(self) -> Stream {
    match self {
      Tone::Success | Tone::Cached | Tone::Info => Stream::Stdout,
      Tone::Warning | Tone::Skipped | Tone::Error => Stream::Stderr,
    }
  }

  fn for_outcome(outcome: &RuleOutcome) -> Tone {
    match outcome {
      RuleOutcome::Built { .. } => Tone::Success,
      RuleOutcome::CacheHit { .. } => Tone::Cached,
      RuleOutcome::Failed { .. } | RuleOutcome::Error { .. } => Tone::Error,
      RuleOutcome::Skipped { .. } | RuleOutcome::Cancelled => Tone::Skipped,
    }
  }

  fn for_notice(level: NoticeLevel) -> Tone {
    match level {
      NoticeLevel::Info => Tone::Info,
      NoticeLevel::Warning => Tone::Warning,
      NoticeLevel::Error => Tone::Error,
    }
  }
}

/// Print `message` behind the tone's marker.
pub fn say(tone: Tone, message: &str) {
  let stream = tone.stream();
  let marker = tone.marker();
  let marker = marker.if_supports_color(stream, |m| match tone {
    Tone::Success => m.green().to_string(),
    Tone::Cached => m.cyan().to_string(),
    Tone::Info => m.blue().to_string(),
    Tone::Warning | Tone::Skipped => m.yellow().to_string(),
    Tone::Error => m.red().to_string(),
  });
  match stream {
    Stream::Stdout => println!("{marker} {message}"),
    _ => eprintln!("{marker} {message}"),
  }
}

/// An indented `label: value` line of a run summary.
pub fn stat(label: &str, value: impl Display) {
  println!("  {}: {value}", label.if_supports_color(Stream::Stdout, |l| l.dimmed()));
}

pub fn emit_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{json}");
  Ok(())
}

/// Wall time at millisecond precision.
pub fn elapsed(duration: Duration) -> String {
  let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
  humantime::format_duration(Duration::from_millis(millis)).to_string()
}

/// The first 12 hex digits of a rule key.
pub fn short_key(key: &RuleKey) -> String {
  key.to_hex().chars().take(12).collect()
}

/// Prints one line per finished rule and every notice.
#[derive(Debug, Default)]
pub struct ConsoleListener;

impl BuildEventListener for ConsoleListener {
  fn on_event(&self, event: &BuildEvent) {
    match event {
      BuildEvent::RuleFinished { target, outcome } => print_outcome(target, outcome),
      BuildEvent::Notice { target, level, message } => {
        let text = match target {
          Some(target) => format!("{target}: {message}"),
          None => message.clone(),
        };
        say(Tone::for_notice(*level), &text);
      }
      _ => {}
    }
  }
}

/// The text after the target on an outcome line.
pub fn describe_outcome(outcome: &RuleOutcome) -> String {
  match outcome {
    RuleOutcome::Built { rule_key } => format!("built {}", short_key(rule_key)),
    RuleOutcome::CacheHit { rule_key } => format!("cache hit {}", short_key(rule_key)),
    other => other.to_string(),
  }
}

fn print_outcome(target: &BuildTarget, outcome: &RuleOutcome) {
  say(Tone::for_outcome(outcome), &format!("{target} {}", describe_outcome(outcome)));
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn outcomes_show_a_short_rule_key() {
    let key: RuleKey = "ab".repeat(32).parse().unwrap();
    assert_eq!(describe_outcome(&RuleOutcome::Built { rule_key: key }), "built abababababab");
    assert_eq!(describe_outcome(&RuleOutcome::CacheHit { rule_key: key }), "cache hit abababababab");
    assert_eq!(
      describe_outcome(&RuleOutcome::Failed {
        step: "genrule".to_string(),
        exit_code: 3,
      }),
      "failed in step genrule (exit code 3)"
    );
  }

  #[test]
  fn problems_are_printed_to_stderr() {
    let skipped = RuleOutcome::Skipped {
      dependency: "//a:b".parse().unwrap(),
    };
    assert!(matches!(Tone::for_outcome(&skipped).stream(), Stream::Stderr));
    assert!(matches!(Tone::for_notice(NoticeLevel::Error).stream(), Stream::Stderr));
    assert!(matches!(Tone::Cached.stream(), Stream::Stdout));
  }

  #[test]
  fn elapsed_drops_sub_millisecond_noise() {
    assert_eq!(elapsed(Duration::from_micros(50_400)), "50ms");
    assert_eq!(elapsed(Duration::from_millis(1500)), "1s 500ms");
    assert_eq!(elapsed(Duration::from_secs(65)), "1m 5s");
  }
}
