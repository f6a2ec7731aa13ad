//! Compensation ordering
//!
//! Compensation steps are indexed into an arena (`id -> usize`) and their
//! `dependsOn` lists become adjacency lists over those indices. Cycle
//! detection is an iterative depth-first search with an explicit stack, so
//! arbitrarily deep chains never touch the call stack.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::definition::{CompensationStep, CompensationStrategy, SagaDefinition};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("cyclic compensation dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
    #[error("compensation step '{compensation}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        compensation: String,
        dependency: String,
    },
}

/// `dependsOn` graph over one definition's compensation steps
pub struct CompensationGraph<'a> {
    steps: Vec<&'a CompensationStep>,
    /// Ordering key: forward index of the compensated step, then list position
    rank: Vec<(usize, usize)>,
    /// node -> the nodes it depends on
    dependencies: Vec<Vec<usize>>,
    /// node -> the nodes that depend on it
    dependents: Vec<Vec<usize>>,
}

impl<'a> CompensationGraph<'a> {
    pub fn build(
        definition: &SagaDefinition,
        steps: &'a [CompensationStep],
    ) -> Result<Self, ResolveError> {
        let index: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.id.as_str(), i))
            .collect();

        let mut dependencies = vec![Vec::new(); steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];

        for (node, step) in steps.iter().enumerate() {
            for dependency in &step.depends_on {
                let Some(&target) = index.get(dependency.as_str()) else {
                    return Err(ResolveError::UnknownDependency {
                        compensation: step.id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                if !dependencies[node].contains(&target) {
                    dependencies[node].push(target);
                    dependents[target].push(node);
                }
            }
        }

        let rank = steps
            .iter()
            .enumerate()
            .map(|(position, step)| {
                let forward = definition.forward_index(&step.step_id).unwrap_or(usize::MAX);
                (forward, position)
            })
            .collect();

        Ok(Self {
            steps: steps.iter().collect(),
            rank,
            dependencies,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// First cycle found, as ids in dependency direction with the start repeated at the end
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.steps.len()];
        // (node, index of the next dependency to explore)
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..self.steps.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::OnStack;
            stack.push((root, 0));

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                if let Some(&dependency) = self.dependencies[node].get(top.1) {
                    top.1 += 1;
                    match marks[dependency] {
                        Mark::Unvisited => {
                            marks[dependency] = Mark::OnStack;
                            stack.push((dependency, 0));
                        }
                        Mark::OnStack => {
                            let start = stack
                                .iter()
                                .position(|(n, _)| *n == dependency)
                                .unwrap_or(0);
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|(n, _)| self.steps[*n].id.clone())
                                .collect();
                            cycle.push(self.steps[dependency].id.clone());
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }

        None
    }

    /// Topological order; independent steps ordered by forward index ascending
    fn topological(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<((usize, usize), usize)>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| Reverse((self.rank[node], node)))
            .collect();

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(Reverse((_, node))) = ready.pop() {
            order.push(node);
            for &dependent in &self.dependents[node] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push(Reverse((self.rank[dependent], dependent)));
                }
            }
        }
        order
    }
}

/// Order compensation steps for a run.
///
/// - BACKWARD: reverse forward-step order, `dependsOn` ignored
/// - FORWARD: forward-step order, `dependsOn` ignored
/// - DEPENDENCY_BASED: topological over `dependsOn`, ties by forward index
/// - CUSTOM: list order as written
///
/// A cyclic `dependsOn` graph is rejected under every strategy.
pub fn resolve_order<'a>(
    definition: &SagaDefinition,
    steps: &'a [CompensationStep],
    strategy: CompensationStrategy,
) -> Result<Vec<&'a CompensationStep>, ResolveError> {
    let graph = CompensationGraph::build(definition, steps)?;
    if let Some(cycle) = graph.find_cycle() {
        return Err(ResolveError::CyclicDependency(cycle));
    }

    let mut nodes: Vec<usize> = (0..graph.len()).collect();
    match strategy {
        CompensationStrategy::Backward => {
            nodes.sort_by_key(|&n| (Reverse(graph.rank[n].0), graph.rank[n].1));
        }
        CompensationStrategy::Forward => {
            nodes.sort_by_key(|&n| graph.rank[n]);
        }
        CompensationStrategy::DependencyBased => {
            nodes = graph.topological();
        }
        CompensationStrategy::Custom => {}
    }

    Ok(nodes.into_iter().map(|n| graph.steps[n]).collect())
}
