//! Per-function and per-edge sample statistics
//!
//! Values are `f64` so that normalized and rescaled save states can be
//! reloaded and summed without truncation.

use crate::symbols::{ClumpId, SymbolRegistry};
use lbrgraph_common::BranchInsn;
use log::debug;
use serde::{Deserialize, Serialize};

/// Samples attributed to one function
///
/// `br_*` count every LBR entry leaving or entering the function. The
/// `tracked_*` counters are filled by the clumper from the edges that
/// survive as call-graph edges, so they never exceed their `br_*` totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FuncStats {
    pub num_samples: f64,
    pub tracked_in: f64,
    pub tracked_out: f64,
    pub br_in: f64,
    pub br_out: f64,
}

impl FuncStats {
    /// One IP sample
    #[must_use]
    pub fn sample() -> Self {
        Self { num_samples: 1.0, ..Self::default() }
    }

    /// One branch leaving (`incoming == false`) or entering the function
    #[must_use]
    pub fn branch(incoming: bool) -> Self {
        if incoming {
            Self { br_in: 1.0, ..Self::default() }
        } else {
            Self { br_out: 1.0, ..Self::default() }
        }
    }

    pub fn add(&mut self, other: &FuncStats) {
        self.num_samples += other.num_samples;
        self.tracked_in += other.tracked_in;
        self.tracked_out += other.tracked_out;
        self.br_in += other.br_in;
        self.br_out += other.br_out;
    }

    /// Branch counters are edge weights seen from one end, so they take
    /// the edge factor and stay comparable with [`EdgeStats`]
    pub fn scale(&mut self, samples: f64, branches: f64) {
        self.num_samples *= samples;
        self.tracked_in *= branches;
        self.tracked_out *= branches;
        self.br_in *= branches;
        self.br_out *= branches;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        if self.tracked_in > self.br_in {
            debug!("More tracked than total in: {} vs {}", self.tracked_in, self.br_in);
            return false;
        }
        if self.tracked_out > self.br_out {
            debug!("More tracked than total out: {} vs {}", self.tracked_out, self.br_out);
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeStats {
    pub num_edges: f64,
}

impl EdgeStats {
    #[must_use]
    pub fn branch() -> Self {
        Self { num_edges: 1.0 }
    }

    pub fn add(&mut self, other: &EdgeStats) {
        self.num_edges += other.num_edges;
    }

    pub fn scale(&mut self, factor: f64) {
        self.num_edges *= factor;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_edges == 0.0
    }
}

/// Call-graph node: a clump and its statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfFunc {
    pub clump: ClumpId,
    pub stats: FuncStats,
}

impl PerfFunc {
    #[must_use]
    pub fn valid(&self, registry: &SymbolRegistry) -> bool {
        if !self.stats.valid() {
            return false;
        }
        let clump = registry.clump(self.clump);
        if !clump.valid() {
            debug!("Invalid function {clump}");
            return false;
        }
        true
    }
}

/// Call-graph edge between two clumps, split by branch kind until clumped
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfEdge {
    pub from: ClumpId,
    pub to: ClumpId,
    pub branch: BranchInsn,
    pub stats: EdgeStats,
}

impl PerfEdge {
    #[must_use]
    pub fn key(&self) -> (ClumpId, ClumpId, BranchInsn) {
        (self.from, self.to, self.branch)
    }

    #[must_use]
    pub fn valid(&self, registry: &SymbolRegistry) -> bool {
        if !registry.clump(self.from).valid() {
            debug!("Invalid edge source {}", registry.clump(self.from));
            return false;
        }
        if self.from != self.to && !registry.clump(self.to).valid() {
            debug!("Invalid edge target {}", registry.clump(self.to));
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_func_stats_validity() {
        let mut s = FuncStats::branch(true);
        s.add(&FuncStats::branch(false));
        assert!(s.valid());
        s.tracked_in = 2.0;
        assert!(!s.valid());
    }

    #[test]
    fn test_scale_and_add() {
        let mut s = FuncStats::sample();
        s.add(&FuncStats::sample());
        s.add(&FuncStats::branch(true));
        s.scale(1.5, 4.0);
        assert_eq!(s.num_samples, 3.0);
        assert_eq!(s.br_in, 4.0);
        assert!(!s.is_empty());
        assert!(FuncStats::default().is_empty());

        let mut e = EdgeStats::branch();
        e.scale(4.0);
        assert_eq!(e.num_edges, 4.0);
    }
}
