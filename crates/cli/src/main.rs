mod cmd;
mod console;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{cmd_build, cmd_targets, cmd_test};
use console::{OutputFormat, Tone, say};

/// kiln - incremental, cache-aware build engine
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Project root (default: current directory)
  #[arg(long, global = true)]
  root: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(long, value_enum, default_value = "text", global = true)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build targets and their dependencies
  Build {
    /// Target patterns: //pkg:name, //pkg: or //pkg/...
    #[arg(required = true)]
    targets: Vec<String>,
  },

  /// Build test targets and run their tests
  Test {
    /// Target patterns (default: every test)
    targets: Vec<String>,

    /// Test selector, [!]class[#method]; repeatable
    #[arg(short, long = "filter")]
    filters: Vec<String>,
  },

  /// List targets
  Targets {
    /// Target patterns (default: every target)
    targets: Vec<String>,

    /// Print each target's rule key
    #[arg(long)]
    show_rulekey: bool,

    /// Print each target's target hash
    #[arg(long)]
    show_target_hash: bool,

    /// Print each target's output path
    #[arg(long)]
    show_output: bool,

    /// Only list targets that use this file as an input; repeatable
    #[arg(long = "referenced-file")]
    referenced_files: Vec<PathBuf>,

    /// Also list tests depending on the selected targets
    #[arg(long)]
    detect_test_changes: bool,

    /// Shorthand for --output json
    #[arg(long)]
    json: bool,
  },
}

fn init_tracing(verbose: bool) {
  let default = if verbose { "warn,kiln_lib=debug,kiln_cli=debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn run(cli: Cli) -> Result<i32> {
  let root = match cli.root {
    Some(root) => root,
    None => std::env::current_dir().context("Failed to determine current directory")?,
  };

  match cli.command {
    Commands::Build { targets } => cmd_build(&root, &targets, cli.output),
    Commands::Test { targets, filters } => cmd_test(&root, &targets, &filters, cli.output),
    Commands::Targets {
      targets,
      show_rulekey,
      show_target_hash,
      show_output,
      referenced_files,
      detect_test_changes,
      json,
    } => {
      let format = if json { OutputFormat::Json } else { cli.output };
      cmd_targets(
        &root,
        &cmd::TargetsOptions {
          patterns: targets,
          show_rulekey,
          show_target_hash,
          show_output,
          referenced_files,
          detect_test_changes,
        },
        format,
      )
    }
  }
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  match run(cli) {
    Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
    Err(e) => {
      say(Tone::Error, &format!("{e:#}"));
      ExitCode::FAILURE
    }
  }
}
