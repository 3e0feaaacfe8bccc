//! Loading a project.
//!
//! `Project::load` reads `kiln.toml`, registers cells, finds every package of
//! every cell, parses their declaration files and builds the target graph.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::build_file_tree::{BuildFileTree, BuildFileTreeError};
use crate::cache::{ArtifactCache, DirArtifactCache, InMemoryArtifactCache, NoopArtifactCache};
use crate::cell::CellRoots;
use crate::config::{CacheMode, ConfigError, KilnConfig};
use crate::description::DescriptionRegistry;
use crate::engine::{BuildEngine, EngineConfig};
use crate::graph::{GraphError, TargetGraph};
use crate::node::{NodeError, NodeParams, TargetNodeFactory};
use crate::parser::{BuildFileParser, JsonBuildFileParser, ParseError};
use crate::rules::{BuildRuleResolver, RuleContext, RuleError};
use crate::target::{BuildTarget, TargetParseError, VisibilityPattern};
use crate::tool::ToolProvider;

#[derive(Debug, Error)]
pub enum ProjectError {
  #[error("project root {path} is not accessible: {source}")]
  Root {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Scan(#[from] BuildFileTreeError),

  #[error(transparent)]
  Parse(#[from] ParseError),

  #[error(transparent)]
  Node(#[from] NodeError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Rule(#[from] RuleError),

  #[error(transparent)]
  Pattern(#[from] TargetParseError),

  #[error("no targets match {pattern}")]
  NoMatch { pattern: String },
}

#[derive(Debug)]
pub struct Project {
  config: Arc<KilnConfig>,
  cells: CellRoots,
  graph: TargetGraph,
  tools: Arc<ToolProvider>,
}

impl Project {
  pub fn load(root: &Path) -> Result<Self, ProjectError> {
    let root = dunce::canonicalize(root).map_err(|source| ProjectError::Root {
      path: root.to_path_buf(),
      source,
    })?;
    let config = KilnConfig::load(&root)?;

    let mut cells = CellRoots::new(&root);
    for (name, path) in &config.cells {
      cells = cells.with_cell(name, root.join(path));
    }

    let registry = Arc::new(DescriptionRegistry::with_defaults());
    let parser = JsonBuildFileParser::new(&config.project.build_file_name);
    let mut nodes = Vec::new();
    for cell in std::iter::once(None).chain(config.cells.keys().map(|name| Some(name.as_str()))) {
      let cell_root = cells.root_of(cell).map_err(GraphError::from)?.to_path_buf();
      // Other cells nested in the project belong to their own cell.
      let mut ignore = config.project.ignore.clone();
      if cell.is_none() {
        ignore.extend(config.cells.values().cloned());
      }
      let tree = BuildFileTree::scan(&cell_root, parser.build_file_name(), &ignore)?;
      let packages: Vec<PathBuf> = tree.packages().map(Path::to_path_buf).collect();
      debug!(cell = cell.unwrap_or("<root>"), packages = packages.len(), "scanned cell");

      let factory = TargetNodeFactory::new(
        Arc::clone(&registry),
        NodeParams::new(tree, config.project.enforce_package_boundary),
      );
      for package in packages {
        for raw in parser.parse_build_file(cell, &cell_root, &package)? {
          nodes.push(factory.create_node(raw)?);
        }
      }
    }

    let graph = TargetGraph::build(nodes)?;
    info!(root = ?root, targets = graph.len(), "loaded project");

    let tools = Arc::new(ToolProvider::from_env(config.tools.clone(), &root));
    Ok(Self {
      config: Arc::new(config),
      cells,
      graph,
      tools,
    })
  }

  pub fn root(&self) -> &Path {
    self.cells.root()
  }

  pub fn config(&self) -> &KilnConfig {
    &self.config
  }

  pub fn cells(&self) -> &CellRoots {
    &self.cells
  }

  pub fn graph(&self) -> &TargetGraph {
    &self.graph
  }

  pub fn rule_context(&self) -> RuleContext {
    RuleContext::new(self.cells.clone(), Arc::clone(&self.config), Arc::clone(&self.tools))
  }

  /// Targets matching any of `patterns`. Patterns use visibility syntax:
  /// `//a:b`, `//a:` or `//a/...`.
  pub fn select(&self, patterns: &[String]) -> Result<BTreeSet<BuildTarget>, ProjectError> {
    let mut selected = BTreeSet::new();
    for text in patterns {
      let pattern = VisibilityPattern::parse(text, None)?;
      let matched: Vec<BuildTarget> = self
        .graph
        .targets()
        .into_iter()
        .filter(|target| pattern.matches(target))
        .collect();
      if matched.is_empty() {
        return Err(ProjectError::NoMatch { pattern: text.clone() });
      }
      selected.extend(matched);
    }
    Ok(selected)
  }

  /// Rules for the part of the graph `targets` need.
  pub async fn resolver(&self, targets: &BTreeSet<BuildTarget>) -> Result<BuildRuleResolver, ProjectError> {
    let closure = self.graph.transitive_closure(targets)?;
    let graph = self.graph.subgraph(&closure);
    Ok(BuildRuleResolver::from_target_graph(&graph, &self.rule_context()).await?)
  }

  /// The artifact cache selected by `[cache] mode`.
  pub fn artifact_cache(&self) -> Arc<dyn ArtifactCache> {
    match self.config.cache.mode {
      CacheMode::Dir => Arc::new(DirArtifactCache::new(self.config.cache_dir(self.root()))),
      CacheMode::Memory => Arc::new(InMemoryArtifactCache::new()),
      CacheMode::None => Arc::new(NoopArtifactCache),
    }
  }

  /// An engine over the rules `targets` need.
  pub async fn engine(&self, targets: &BTreeSet<BuildTarget>) -> Result<BuildEngine, ProjectError> {
    let resolver = self.resolver(targets).await?;
    Ok(BuildEngine::new(
      Arc::new(resolver),
      self.artifact_cache(),
      EngineConfig::from_config(&self.config),
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{t, write_file};
  use serial_test::serial;

  fn sample(root: &Path) {
    write_file(
      root,
      "lib/BUILD.json",
      r#"[{"type": "export_file", "name": "a.txt", "visibility": ["PUBLIC"]}]"#,
    );
    write_file(root, "lib/a.txt", "alpha");
    write_file(
      root,
      "app/BUILD.json",
      r#"[{"type": "genrule", "name": "gen", "srcs": ["//lib:a.txt"], "cmd": "cat $SRCS > $OUT", "out": "o.txt"}]"#,
    );
  }

  #[test]
  #[serial]
  fn load_builds_the_graph_from_every_package() {
    let dir = tempfile::tempdir().unwrap();
    sample(dir.path());
    let project = Project::load(dir.path()).unwrap();

    assert_eq!(project.graph().targets(), BTreeSet::from([t("//app:gen"), t("//lib:a.txt")]));
    assert_eq!(project.graph().dependencies(&t("//app:gen")), BTreeSet::from([t("//lib:a.txt")]));
  }

  #[test]
  #[serial]
  fn select_expands_patterns() {
    let dir = tempfile::tempdir().unwrap();
    sample(dir.path());
    let project = Project::load(dir.path()).unwrap();

    assert_eq!(
      project.select(&["//...".to_string()]).unwrap(),
      BTreeSet::from([t("//app:gen"), t("//lib:a.txt")])
    );
    assert_eq!(project.select(&["//lib:".to_string()]).unwrap(), BTreeSet::from([t("//lib:a.txt")]));
    let err = project.select(&["//nope:x".to_string()]).unwrap_err();
    assert_eq!(err.to_string(), "no targets match //nope:x");
  }

  #[test]
  #[serial]
  fn config_controls_build_file_name_and_cells() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
      dir.path(),
      "kiln.toml",
      "[project]\nbuild_file_name = \"TARGETS.json\"\n\n[cells]\nvendor = \"third_party\"\n",
    );
    write_file(dir.path(), "app/TARGETS.json", r#"[{"type": "export_file", "name": "x"}]"#);
    write_file(dir.path(), "app/BUILD.json", "not json");
    write_file(dir.path(), "third_party/zlib/TARGETS.json", r#"[{"type": "export_file", "name": "z"}]"#);

    let project = Project::load(dir.path()).unwrap();
    let names: Vec<String> = project.graph().targets().iter().map(ToString::to_string).collect();
    assert_eq!(names, vec!["//app:x", "vendor//zlib:z"]);
  }

  #[test]
  #[serial]
  fn malformed_declaration_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "app/BUILD.json", "{}");
    let err = Project::load(dir.path()).unwrap_err();
    assert!(matches!(err, ProjectError::Parse(ParseError::NotAnArray { .. })));
  }
}
