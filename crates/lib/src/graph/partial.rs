use std::collections::BTreeSet;

use super::{GraphError, TargetGraph};
use crate::node::TargetNode;
use crate::target::BuildTarget;

/// A subgraph selected by a predicate, widened by an "associated" predicate
/// and closed over dependencies.
#[derive(Debug, Clone)]
pub struct PartialGraph {
  graph: TargetGraph,
  selected: BTreeSet<BuildTarget>,
}

impl PartialGraph {
  /// Select nodes matching `predicate`, add nodes `associated` reports as
  /// belonging to that selection, then include every transitive dependency.
  pub fn create<P, A>(graph: &TargetGraph, predicate: P, associated: A) -> Result<Self, GraphError>
  where
    P: Fn(&TargetNode) -> bool,
    A: Fn(&TargetNode, &BTreeSet<BuildTarget>) -> bool,
  {
    let matched: BTreeSet<BuildTarget> = graph
      .nodes()
      .into_iter()
      .filter(|node| predicate(node))
      .map(|node| node.target().clone())
      .collect();

    let mut selected = matched.clone();
    selected.extend(
      graph
        .nodes()
        .into_iter()
        .filter(|node| !matched.contains(node.target()) && associated(node, &matched))
        .map(|node| node.target().clone()),
    );

    let closure = graph.transitive_closure(&selected)?;
    Ok(Self {
      graph: graph.subgraph(&closure),
      selected,
    })
  }

  pub fn graph(&self) -> &TargetGraph {
    &self.graph
  }

  /// Targets chosen by the predicates, before dependency closure.
  pub fn selected(&self) -> &BTreeSet<BuildTarget> {
    &self.selected
  }
}

/// Associates test targets with the targets they depend on.
pub fn associated_tests(node: &TargetNode, selected: &BTreeSet<BuildTarget>) -> bool {
  node.is_test() && node.deps().iter().any(|dep| selected.contains(&dep.unflavored()))
}

/// Associates nothing.
pub fn no_associations(_node: &TargetNode, _selected: &BTreeSet<BuildTarget>) -> bool {
  false
}
