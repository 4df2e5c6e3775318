//! Stage dependency graph
//!
//! A static DAG over [`Stage`] nodes. Edges point from a dependency to the
//! stage that consumes it.

use crate::error::GraphError;
use crate::units::FileUnit;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{Bfs, Reversed};
use petgraph::Direction;
use stagecraft_artifact::{ContentHash, ProjectRequirements, Stage};
use std::collections::BTreeSet;

/// Dependency edges of the standard pipeline
const STANDARD_EDGES: [(Stage, Stage); 4] = [
    (Stage::Brief, Stage::RequirementsText),
    (Stage::RequirementsText, Stage::RequirementsStructured),
    (Stage::RequirementsStructured, Stage::Scaffold),
    (Stage::Scaffold, Stage::CodeGen),
];

#[derive(Debug, Clone)]
pub struct StageGraph {
    inner: DiGraphMap<Stage, ()>,
    order: Vec<Stage>,
}

impl StageGraph {
    /// The brief → requirements → scaffold → code chain
    #[must_use]
    pub fn standard() -> Self {
        let mut inner = DiGraphMap::new();
        for stage in Stage::ALL {
            inner.add_node(stage);
        }
        for (from, to) in STANDARD_EDGES {
            inner.add_edge(from, to, ());
        }
        Self {
            inner,
            order: Stage::ALL.to_vec(),
        }
    }

    /// Build a graph from `(dependency, dependent)` edges
    ///
    /// Every stage is present as a node even without edges.
    ///
    /// # Errors
    /// `SelfLoop` or `CycleDetected` if the edges do not form a DAG
    pub fn from_edges(edges: &[(Stage, Stage)]) -> Result<Self, GraphError> {
        let mut inner = DiGraphMap::new();
        for stage in Stage::ALL {
            inner.add_node(stage);
        }
        for &(from, to) in edges {
            if from == to {
                return Err(GraphError::SelfLoop(from));
            }
            inner.add_edge(from, to, ());
        }
        if petgraph::algo::is_cyclic_directed(&inner) {
            return Err(GraphError::CycleDetected);
        }
        let order = stable_topological_order(&inner)?;
        Ok(Self { inner, order })
    }

    /// Direct dependencies of a stage
    #[must_use]
    pub fn dependencies_of(&self, stage: Stage) -> BTreeSet<Stage> {
        self.inner
            .neighbors_directed(stage, Direction::Incoming)
            .collect()
    }

    /// Transitive dependents of a stage (excluding itself)
    #[must_use]
    pub fn descendants_of(&self, stage: Stage) -> BTreeSet<Stage> {
        let mut out = BTreeSet::new();
        let mut bfs = Bfs::new(&self.inner, stage);
        while let Some(node) = bfs.next(&self.inner) {
            if node != stage {
                out.insert(node);
            }
        }
        out
    }

    /// Transitive dependencies of a stage (excluding itself)
    #[must_use]
    pub fn ancestors_of(&self, stage: Stage) -> BTreeSet<Stage> {
        let reversed = Reversed(&self.inner);
        let mut out = BTreeSet::new();
        let mut bfs = Bfs::new(reversed, stage);
        while let Some(node) = bfs.next(reversed) {
            if node != stage {
                out.insert(node);
            }
        }
        out
    }

    /// Stages ordered so every dependency precedes its dependents; ties
    /// follow pipeline order
    #[inline]
    #[must_use]
    pub fn topological_order(&self) -> &[Stage] {
        &self.order
    }

    /// `stage` and every stage after it in topological order
    #[must_use]
    pub fn from_stage(&self, stage: Stage) -> Vec<Stage> {
        self.order
            .iter()
            .skip_while(|s| **s != stage)
            .copied()
            .collect()
    }

    /// Expand CODE_GEN into one generation unit per scaffold leaf
    ///
    /// # Errors
    /// Returns error if a unit fingerprint cannot be computed
    pub fn file_units(
        &self,
        scaffold: &ProjectRequirements,
        brief: &ContentHash,
    ) -> Result<Vec<FileUnit>, GraphError> {
        FileUnit::expand(scaffold, brief)
    }

    /// Number of dependency edges
    #[inline]
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::standard()
    }
}

/// Kahn's algorithm, always releasing the earliest ready stage first
fn stable_topological_order(graph: &DiGraphMap<Stage, ()>) -> Result<Vec<Stage>, GraphError> {
    let mut indegree: std::collections::BTreeMap<Stage, usize> = graph
        .nodes()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let mut ready: BTreeSet<Stage> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(s, _)| *s)
        .collect();
    let mut order = Vec::with_capacity(indegree.len());

    while let Some(stage) = ready.pop_first() {
        order.push(stage);
        for next in graph.neighbors_directed(stage, Direction::Outgoing) {
            if let Some(d) = indegree.get_mut(&next) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    if order.len() == indegree.len() {
        Ok(order)
    } else {
        Err(GraphError::CycleDetected)
    }
}
