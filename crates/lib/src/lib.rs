//! kiln-lib: the incremental build engine behind `kiln`
//!
//! - `TargetNode`: a validated declaration with its dependencies and inputs
//! - `TargetGraph`: the dependency DAG over all nodes of a project
//! - `BuildRule`: a node materialized into ordered steps and outputs
//! - `RuleKey`: the content fingerprint that decides cache hits
//! - `BuildEngine`: schedules rules, consults the cache and runs steps

pub mod attrs;
pub mod build_file_tree;
pub mod cache;
pub mod cell;
pub mod config;
pub mod consts;
pub mod description;
pub mod engine;
pub mod graph;
pub mod node;
pub mod parser;
pub mod platform;
pub mod process;
pub mod project;
pub mod rulekey;
pub mod rules;
pub mod step;
pub mod target;
pub mod testing;
pub mod throttle;
pub mod tool;
pub mod util;
