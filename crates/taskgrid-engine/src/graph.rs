//! Dependency graph with cycle detection (Kahn's algorithm).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use taskgrid_core::TaskId;

/// A directed graph where an edge `source → target` means
/// "target depends on source".
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    vertices: BTreeSet<TaskId>,
    edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, id: &str) {
        self.vertices.insert(id.to_string());
    }

    /// Add an edge; both endpoints become vertices. Duplicate edges are ignored.
    pub fn add_edge(&mut self, source: &str, target: &str) {
        self.add_vertex(source);
        self.add_vertex(target);
        self.edges
            .entry(source.to_string())
            .or_default()
            .insert(target.to_string());
    }

    /// Order vertices so every source precedes its targets.
    ///
    /// Ties are broken by id, so the order is deterministic. On a cycle,
    /// returns the vertices that could not be ordered: every vertex on a
    /// cycle plus everything downstream of one.
    pub fn topological_order(&self) -> Result<Vec<TaskId>, Vec<TaskId>> {
        let mut in_degree: BTreeMap<&str, usize> =
            self.vertices.iter().map(|v| (v.as_str(), 0)).collect();
        for targets in self.edges.values() {
            for target in targets {
                if let Some(degree) = in_degree.get_mut(target.as_str()) {
                    *degree += 1;
                }
            }
        }

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(v, _)| *v)
            .collect();
        let mut order = Vec::with_capacity(self.vertices.len());

        while let Some(vertex) = ready.pop_front() {
            order.push(vertex.to_string());
            let Some(targets) = self.edges.get(vertex) else {
                continue;
            };
            for target in targets {
                if let Some(degree) = in_degree.get_mut(target.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(target.as_str());
                    }
                }
            }
        }

        if order.len() == self.vertices.len() {
            Ok(order)
        } else {
            let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            Err(self
                .vertices
                .iter()
                .filter(|v| !placed.contains(v.as_str()))
                .cloned()
                .collect())
        }
    }
}
