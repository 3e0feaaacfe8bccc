//! The target graph.
//!
//! Vertices are `TargetNode`s; edges run from a dependency to its dependent
//! and cover both declared and extra dependencies. Building the graph checks
//! that every referenced target exists, that each dependency is visible to
//! its dependent, and that there are no cycles.

pub mod hash;
pub mod partial;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

use crate::node::{NodeError, TargetNode};
use crate::target::BuildTarget;

pub use hash::{TargetHashes, target_hashes};
pub use partial::{PartialGraph, associated_tests};

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("target {target} is declared more than once")]
  DuplicateTarget { target: String },

  #[error("no such target {target} (referenced by {referenced_by})")]
  NoSuchTarget { target: String, referenced_by: String },

  #[error("no such target {target}")]
  UnknownTarget { target: String },

  #[error(transparent)]
  Node(#[from] NodeError),

  #[error(transparent)]
  Cell(#[from] crate::cell::UnknownCellError),

  #[error("dependency cycle detected involving {target}")]
  Cycle { target: String },
}

#[derive(Debug, Clone, Default)]
pub struct TargetGraph {
  graph: DiGraph<Arc<TargetNode>, ()>,
  index: HashMap<BuildTarget, NodeIndex>,
}

impl TargetGraph {
  /// Build the graph. Flavored references to targets declared without that
  /// flavor are satisfied by deriving a flavored sibling of the declared node.
  pub fn build(nodes: impl IntoIterator<Item = TargetNode>) -> Result<Self, GraphError> {
    let mut graph = Self::default();
    for node in nodes {
      graph.insert(Arc::new(node))?;
    }

    let mut pending: VecDeque<NodeIndex> = graph.graph.node_indices().collect();
    let mut edges = Vec::new();
    while let Some(dependent_idx) = pending.pop_front() {
      let dependent = graph.graph[dependent_idx].clone();
      for dep in dependent.deps() {
        let dep_idx = match graph.index.get(&dep) {
          Some(&idx) => idx,
          None => {
            let base = graph
              .get(&dep.unflavored())
              .filter(|_| dep.is_flavored())
              .ok_or_else(|| GraphError::NoSuchTarget {
                target: dep.to_string(),
                referenced_by: dependent.target().to_string(),
              })?;
            let flavored = base.with_flavors(dep.flavors().iter().cloned())?;
            debug!(target = %dep, "derived flavored node");
            let idx = graph.insert(Arc::new(flavored))?;
            pending.push_back(idx);
            idx
          }
        };
        graph.graph[dep_idx].check_visibility(dependent.target())?;
        edges.push((dep_idx, dependent_idx));
      }
    }
    for (from, to) in edges {
      graph.graph.add_edge(from, to, ());
    }

    graph.topological_indices()?;
    Ok(graph)
  }

  fn insert(&mut self, node: Arc<TargetNode>) -> Result<NodeIndex, GraphError> {
    let target = node.target().clone();
    if self.index.contains_key(&target) {
      return Err(GraphError::DuplicateTarget {
        target: target.to_string(),
      });
    }
    let idx = self.graph.add_node(node);
    self.index.insert(target, idx);
    Ok(idx)
  }

  fn topological_indices(&self) -> Result<Vec<NodeIndex>, GraphError> {
    toposort(&self.graph, None).map_err(|cycle| GraphError::Cycle {
      target: self.graph[cycle.node_id()].target().to_string(),
    })
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  pub fn get(&self, target: &BuildTarget) -> Option<&Arc<TargetNode>> {
    self.index.get(target).map(|&idx| &self.graph[idx])
  }

  pub fn require(&self, target: &BuildTarget) -> Result<&Arc<TargetNode>, GraphError> {
    self.get(target).ok_or_else(|| GraphError::UnknownTarget {
      target: target.to_string(),
    })
  }

  /// All nodes, sorted by target.
  pub fn nodes(&self) -> Vec<&Arc<TargetNode>> {
    let mut nodes: Vec<_> = self.graph.node_weights().collect();
    nodes.sort_by(|a, b| a.target().cmp(b.target()));
    nodes
  }

  pub fn targets(&self) -> BTreeSet<BuildTarget> {
    self.index.keys().cloned().collect()
  }

  /// Direct dependencies of `target`, sorted.
  pub fn dependencies(&self, target: &BuildTarget) -> BTreeSet<BuildTarget> {
    self.neighbors(target, Direction::Incoming)
  }

  /// Direct dependents of `target`, sorted.
  pub fn dependents(&self, target: &BuildTarget) -> BTreeSet<BuildTarget> {
    self.neighbors(target, Direction::Outgoing)
  }

  fn neighbors(&self, target: &BuildTarget, direction: Direction) -> BTreeSet<BuildTarget> {
    self
      .index
      .get(target)
      .map(|&idx| {
        self
          .graph
          .neighbors_directed(idx, direction)
          .map(|n| self.graph[n].target().clone())
          .collect()
      })
      .unwrap_or_default()
  }

  /// Every node, dependencies before dependents.
  pub fn topological_order(&self) -> Result<Vec<Arc<TargetNode>>, GraphError> {
    Ok(
      self
        .topological_indices()?
        .into_iter()
        .map(|idx| self.graph[idx].clone())
        .collect(),
    )
  }

  /// `roots` plus everything they transitively depend on.
  pub fn transitive_closure<'a>(
    &self,
    roots: impl IntoIterator<Item = &'a BuildTarget>,
  ) -> Result<BTreeSet<BuildTarget>, GraphError> {
    let mut seen = BTreeSet::new();
    let mut stack = Vec::new();
    for root in roots {
      self.require(root)?;
      stack.push(root.clone());
    }
    while let Some(target) = stack.pop() {
      if seen.insert(target.clone()) {
        stack.extend(self.dependencies(&target));
      }
    }
    Ok(seen)
  }

  /// `roots` plus everything that transitively depends on them.
  pub fn transitive_dependents<'a>(&self, roots: impl IntoIterator<Item = &'a BuildTarget>) -> BTreeSet<BuildTarget> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<BuildTarget> = roots.into_iter().cloned().collect();
    while let Some(target) = stack.pop() {
      if seen.insert(target.clone()) {
        stack.extend(self.dependents(&target));
      }
    }
    seen
  }

  /// The node-induced subgraph over `targets`. Unknown targets are ignored.
  pub fn subgraph(&self, targets: &BTreeSet<BuildTarget>) -> TargetGraph {
    let mut sub = TargetGraph::default();
    for target in targets {
      if let Some(node) = self.get(target) {
        let idx = sub.graph.add_node(node.clone());
        sub.index.insert(target.clone(), idx);
      }
    }
    for edge in self.graph.raw_edges() {
      let from = self.graph[edge.source()].target();
      let to = self.graph[edge.target()].target();
      if let (Some(&a), Some(&b)) = (sub.index.get(from), sub.index.get(to)) {
        sub.graph.add_edge(a, b, ());
      }
    }
    sub
  }

  /// Nodes whose inputs include `path` (relative to the project root).
  pub fn owners_of(&self, path: &Path) -> BTreeSet<BuildTarget> {
    self
      .graph
      .node_weights()
      .filter(|node| node.target().cell().is_none() && node.inputs().contains(path))
      .map(|node| node.target().clone())
      .collect()
  }
}
