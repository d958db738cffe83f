//! Clumped call graph handed to layout tools

use super::stats::{PerfEdge, PerfFunc};
use crate::symbols::{ClumpId, SymbolRegistry};
use log::debug;
use std::collections::HashSet;

/// Nodes and weighted edges after filtering and clumping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallGraph {
    funcs: Vec<PerfFunc>,
    edges: Vec<PerfEdge>,
}

impl CallGraph {
    #[must_use]
    pub fn new(funcs: Vec<PerfFunc>, edges: Vec<PerfEdge>) -> Self {
        Self { funcs, edges }
    }

    #[must_use]
    pub fn funcs(&self) -> &[PerfFunc] {
        &self.funcs
    }

    #[must_use]
    pub fn edges(&self) -> &[PerfEdge] {
        &self.edges
    }

    pub fn into_parts(self) -> (Vec<PerfFunc>, Vec<PerfEdge>) {
        (self.funcs, self.edges)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    #[must_use]
    pub fn func(&self, clump: ClumpId) -> Option<&PerfFunc> {
        self.funcs.iter().find(|f| f.clump == clump)
    }

    #[must_use]
    pub fn total_samples(&self) -> f64 {
        self.funcs.iter().map(|f| f.stats.num_samples).sum()
    }

    #[must_use]
    pub fn total_edge_weight(&self) -> f64 {
        self.edges.iter().map(|e| e.stats.num_edges).sum()
    }

    /// Every node and edge validates, edges join nodes of the graph, and no
    /// two nodes of one DSO overlap
    #[must_use]
    pub fn valid(&self, registry: &SymbolRegistry) -> bool {
        if !self.funcs.iter().all(|f| f.valid(registry)) || !self.edges.iter().all(|e| e.valid(registry)) {
            return false;
        }

        let nodes: HashSet<ClumpId> = self.funcs.iter().map(|f| f.clump).collect();
        if nodes.len() != self.funcs.len() {
            debug!("Duplicate call graph nodes");
            return false;
        }
        if let Some(e) = self.edges.iter().find(|e| !nodes.contains(&e.from) || !nodes.contains(&e.to)) {
            debug!("Edge {} -> {} leaves the graph", e.from, e.to);
            return false;
        }

        let mut spans: Vec<_> = self
            .funcs
            .iter()
            .map(|f| {
                let clump = registry.clump(f.clump);
                (clump.dso(), clump.range(), clump)
            })
            .collect();
        spans.sort_by_key(|(dso, range, _)| (*dso, *range));
        for (i, (dso, range, clump)) in spans.iter().enumerate() {
            for (other_dso, other_range, other) in &spans[i + 1..] {
                if other_dso != dso || other_range.lo >= range.end() {
                    break;
                }
                if clump.overlaps(other) {
                    debug!("Overlapping nodes {clump} and {other}");
                    return false;
                }
            }
        }
        true
    }
}
