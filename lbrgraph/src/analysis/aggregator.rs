//! Sample aggregation
//!
//! Resolves every parsed sample to function clumps and accumulates counts
//! per `(pid, tid)` bucket:
//!
//! ```text
//! tpid ──► clump ──────────────► FuncStats
//!      └─► (from, to, branch) ─► EdgeStats
//! ```
//!
//! Running totals are kept next to the buckets; [`SampleAggregator::valid`]
//! checks that both views agree and that branch counts balance.
//!
//! # Passes
//!
//! The info pass (`collect_mmap` / `collect_fork`) must complete and be
//! followed by [`SampleAggregator::finalize_mappings`] before the event pass
//! (`collect_simple` / `collect_lbr`) resolves any address.

// Call distances are accumulated as f64
#![allow(clippy::cast_precision_loss)]

use super::callgraph::CallGraph;
use super::clumper::Clumper;
use super::filter::{EdgeFilter, FuncFilter};
use super::stats::{EdgeStats, FuncStats, PerfEdge, PerfFunc};
use crate::symbols::{ClumpId, Mappings, SymbolRegistry};
use crate::telemetry::Telemetry;
use crate::trace::{InfoSample, LbrSample, SimpleSample};
use lbrgraph_common::BranchInsn;
use log::{debug, trace};
use std::collections::HashMap;

/// Branches whose endpoints differ above the low 12 bits cross a page
const PAGE_CROSS_DISTANCE: u64 = 4096;

pub type EdgeKey = (ClumpId, ClumpId, BranchInsn);

// ============================================================================
// Per-(pid, tid) Bucket
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct TpidStats {
    funcs: HashMap<ClumpId, FuncStats>,
    edges: HashMap<EdgeKey, EdgeStats>,
    func_total: FuncStats,
    edge_total: EdgeStats,
}

impl TpidStats {
    pub fn add_func(&mut self, clump: ClumpId, stats: &FuncStats) {
        self.funcs.entry(clump).or_default().add(stats);
        self.func_total.add(stats);
    }

    pub fn add_edge(&mut self, key: EdgeKey, stats: &EdgeStats) {
        self.edges.entry(key).or_default().add(stats);
        self.edge_total.add(stats);
    }

    fn add_branch(&mut self, from: ClumpId, to: ClumpId, branch: BranchInsn) {
        self.add_edge((from, to, branch), &EdgeStats::branch());
        self.add_func(from, &FuncStats::branch(false));
        self.add_func(to, &FuncStats::branch(true));
    }

    /// Sum `other` into `self`
    pub fn merge(&mut self, other: &TpidStats) {
        for (clump, stats) in &other.funcs {
            self.funcs.entry(*clump).or_default().add(stats);
        }
        for (key, stats) in &other.edges {
            self.edges.entry(*key).or_default().add(stats);
        }
        self.func_total.add(&other.func_total);
        self.edge_total.add(&other.edge_total);
    }

    #[must_use]
    pub fn funcs(&self) -> &HashMap<ClumpId, FuncStats> {
        &self.funcs
    }

    #[must_use]
    pub fn edges(&self) -> &HashMap<EdgeKey, EdgeStats> {
        &self.edges
    }

    #[must_use]
    pub fn func_total(&self) -> &FuncStats {
        &self.func_total
    }

    #[must_use]
    pub fn edge_total(&self) -> &EdgeStats {
        &self.edge_total
    }

    #[must_use]
    pub fn valid(&self, registry: &SymbolRegistry) -> bool {
        let mut funcs = FuncStats::default();
        for (&clump, stats) in &self.funcs {
            if !(PerfFunc { clump, stats: *stats }).valid(registry) {
                return false;
            }
            funcs.add(stats);
        }
        if funcs != self.func_total {
            debug!("Function stats do not sum to bucket total");
            return false;
        }

        let mut edges = EdgeStats::default();
        for (&(from, to, branch), stats) in &self.edges {
            if !(PerfEdge { from, to, branch, stats: *stats }).valid(registry) {
                return false;
            }
            edges.add(stats);
        }
        if edges != self.edge_total {
            debug!("Edge stats do not sum to bucket total");
            return false;
        }
        balanced(&funcs, &edges)
    }
}

fn balanced(funcs: &FuncStats, edges: &EdgeStats) -> bool {
    if !funcs.valid() {
        return false;
    }
    if funcs.tracked_in != funcs.tracked_out {
        debug!("Unbalanced tracked samples: {} in, {} out", funcs.tracked_in, funcs.tracked_out);
        return false;
    }
    if funcs.br_in != edges.num_edges {
        debug!("Branch samples in ({}) do not match edges ({})", funcs.br_in, edges.num_edges);
        return false;
    }
    if funcs.br_in != funcs.br_out {
        debug!("Unbalanced branch samples: {} in, {} out", funcs.br_in, funcs.br_out);
        return false;
    }
    true
}

// ============================================================================
// Aggregator
// ============================================================================

/// Owns the symbol registry and mapping tracker for one run
#[derive(Debug, Default)]
pub struct SampleAggregator {
    registry: SymbolRegistry,
    mappings: Mappings,
    tpids: HashMap<u64, TpidStats>,
    func_total: FuncStats,
    edge_total: EdgeStats,
    skipped: u64,
}

impl SampleAggregator {
    #[must_use]
    pub fn new(registry: SymbolRegistry) -> Self {
        Self { registry, ..Self::default() }
    }

    #[must_use]
    pub fn symbols(&self) -> &SymbolRegistry {
        &self.registry
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolRegistry {
        &mut self.registry
    }

    /// Give up the registry once the graph has been built
    #[must_use]
    pub fn into_symbols(self) -> SymbolRegistry {
        self.registry
    }

    #[must_use]
    pub fn mappings(&self) -> &Mappings {
        &self.mappings
    }

    #[must_use]
    pub fn tpids(&self) -> &HashMap<u64, TpidStats> {
        &self.tpids
    }

    /// Samples rejected as malformed
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    #[must_use]
    pub fn func_total(&self) -> &FuncStats {
        &self.func_total
    }

    #[must_use]
    pub fn edge_total(&self) -> &EdgeStats {
        &self.edge_total
    }

    // ------------------------------------------------------------------------
    // Info pass
    // ------------------------------------------------------------------------

    pub fn collect_mmap(&mut self, info: &InfoSample<'_>) -> bool {
        info.as_mmap().is_some_and(|mmap| self.mappings.add_mmap(&info.header, mmap))
    }

    pub fn collect_fork(&mut self, info: &InfoSample<'_>, telemetry: &mut Telemetry) -> bool {
        info.as_fork().is_some_and(|fork| self.mappings.add_fork(&info.header, fork, telemetry))
    }

    pub fn finalize_mappings(&mut self) {
        self.mappings.finalize();
    }

    // ------------------------------------------------------------------------
    // Event pass
    // ------------------------------------------------------------------------

    /// Attribute one IP sample; false if it was malformed or unresolvable
    pub fn collect_simple(&mut self, sample: &mut SimpleSample<'_>, telemetry: &mut Telemetry) -> bool {
        telemetry.total_samples += 1;
        if !sample.valid() {
            self.skipped += 1;
            return false;
        }

        let dso = self.registry.get_dso(sample.loc.dso, telemetry);
        self.registry.add_comm(dso, sample.header.comm);
        if !self.mappings.fillin_sample_loc(&self.registry, dso, &sample.header, &mut sample.loc, None, telemetry) {
            trace!("Unable to fill in {} -> {:#x}", sample.loc.dso, sample.loc.mapped_addr);
            return false;
        }

        let clump = self.registry.get_func(dso, sample.loc.unmapped_addr, telemetry);
        self.registry.add_sample_addr(clump, sample.loc.unmapped_addr);
        let stats = FuncStats::sample();
        self.tpids.entry(sample.header.tpid()).or_default().add_func(clump, &stats);
        self.func_total.add(&stats);
        telemetry.total_tracked_samples += 1;
        true
    }

    /// Attribute an IP sample and its branch stack
    ///
    /// Entries whose endpoints cannot be resolved are skipped individually.
    /// Returns true if the IP or at least one branch was attributed.
    pub fn collect_lbr(&mut self, sample: &mut LbrSample<'_>, telemetry: &mut Telemetry) -> bool {
        if !sample.valid() {
            self.skipped += 1;
            return false;
        }
        let mut attributed = self.collect_simple(&mut sample.sample, telemetry);

        let header = sample.sample.header;
        let bucket = self.tpids.entry(header.tpid()).or_default();
        for br in sample.branches_mut() {
            telemetry.total_branches += 1;
            let from_dso = self.registry.get_dso(br.from.dso, telemetry);
            let to_dso = self.registry.get_dso(br.to.dso, telemetry);
            self.registry.add_comm(from_dso, header.comm);
            self.registry.add_comm(to_dso, header.comm);

            let resolved = self.mappings.fillin_sample_loc(
                &self.registry,
                from_dso,
                &header,
                &mut br.from,
                Some(&mut br.branch),
                telemetry,
            ) && self.mappings.fillin_sample_loc(&self.registry, to_dso, &header, &mut br.to, None, telemetry);
            if !resolved {
                trace!(
                    "Unable to fill in {} -> {} ({:#x} -> {:#x})",
                    br.from.dso,
                    br.to.dso,
                    br.from.mapped_addr,
                    br.to.mapped_addr
                );
                continue;
            }

            let from = self.registry.get_func(from_dso, br.from.unmapped_addr, telemetry);
            let to = self.registry.get_func(to_dso, br.to.unmapped_addr, telemetry);
            telemetry.total_tracked_branches += 1;
            self.registry.add_sample_addr(from, br.from.unmapped_addr);
            self.registry.add_sample_addr(to, br.to.unmapped_addr);

            if from != to && br.branch.is_trackable_call() {
                let (a, b) = (br.from.unmapped_addr, br.to.unmapped_addr);
                telemetry.total_true_calls += 1;
                telemetry.average_call_dist += a.abs_diff(b) as f64;
                if (a ^ b) > PAGE_CROSS_DISTANCE {
                    telemetry.total_page_cross_calls += 1;
                }
            }

            bucket.add_branch(from, to, br.branch);
            self.edge_total.add(&EdgeStats::branch());
            self.func_total.add(&FuncStats::branch(false));
            self.func_total.add(&FuncStats::branch(true));
            attributed = true;
        }
        attributed
    }

    /// Sum a bucket into this aggregator (reloaded state, other runs)
    pub fn add(&mut self, tpid: u64, stats: &TpidStats) {
        self.tpids.entry(tpid).or_default().merge(stats);
        self.func_total.add(&stats.func_total);
        self.edge_total.add(&stats.edge_total);
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn valid(&self) -> bool {
        let mut funcs = FuncStats::default();
        let mut edges = EdgeStats::default();
        for (tpid, stats) in &self.tpids {
            if !stats.valid(&self.registry) {
                debug!("Invalid bucket {tpid:#x}");
                return false;
            }
            funcs.add(&stats.func_total);
            edges.add(&stats.edge_total);
        }
        if !balanced(&funcs, &edges) {
            return false;
        }
        if funcs != self.func_total || edges != self.edge_total {
            debug!("Bucket totals do not match aggregate totals");
            return false;
        }
        if self.skipped != 0 {
            debug!("{} malformed samples were skipped", self.skipped);
            return false;
        }
        true
    }

    /// Collapse the buckets each filter accepts and select matching entries
    ///
    /// Functions come back ordered by clump handle, edges by key.
    #[must_use]
    pub fn filter(&self, func_filter: &dyn FuncFilter, edge_filter: &dyn EdgeFilter) -> (Vec<PerfFunc>, Vec<PerfEdge>) {
        let mut funcs: Vec<PerfFunc> = self
            .collapse(|tpid| func_filter.match_tpid(tpid))
            .funcs
            .into_iter()
            .filter(|(clump, _)| func_filter.match_func(&self.registry, *clump))
            .map(|(clump, stats)| PerfFunc { clump, stats })
            .collect();
        funcs.sort_by_key(|f| f.clump);

        let mut edges: Vec<PerfEdge> = self
            .collapse(|tpid| edge_filter.match_tpid(tpid))
            .edges
            .into_iter()
            .filter(|((from, to, branch), _)| edge_filter.match_edge(&self.registry, *from, *to, *branch))
            .map(|((from, to, branch), stats)| PerfEdge { from, to, branch, stats })
            .collect();
        edges.sort_by_key(PerfEdge::key);

        (funcs, edges)
    }

    /// [`filter`](Self::filter), then clump the result into a call graph
    pub fn filter_and_clump(
        &mut self,
        func_filter: &dyn FuncFilter,
        edge_filter: &dyn EdgeFilter,
        clumper: &dyn Clumper,
        telemetry: &mut Telemetry,
    ) -> CallGraph {
        let (mut funcs, mut edges) = self.filter(func_filter, edge_filter);
        clumper.clump(&mut self.registry, &mut funcs, &mut edges, telemetry);
        CallGraph::new(funcs, edges)
    }

    fn collapse(&self, matches: impl Fn(u64) -> bool) -> TpidStats {
        let mut out = TpidStats::default();
        for (tpid, stats) in &self.tpids {
            if matches(*tpid) {
                out.merge(stats);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::filter::AcceptAll;
    use crate::domain::{Pid, Tid, Timestamp};
    use crate::symbols::{FuncSymbol, MemoryImage, MemoryLoader};
    use crate::trace::{InfoRecord, LbrBranch, MmapRecord, SampleHeader, SampleLoc};

    const APP: &str = "/bin/app";

    fn aggregator() -> SampleAggregator {
        // main calls helper at 0x110; helper returns at 0x150
        let image = MemoryImage::new(vec![FuncSymbol::new("main", 0x100, 0x140), FuncSymbol::new("helper", 0x140, 0x160)])
            .with_bytes(0x110, &[0xe8, 0x2b, 0x00, 0x00, 0x00])
            .with_bytes(0x150, &[0xc3]);
        let registry = SymbolRegistry::new(Box::new(MemoryLoader::new().with_image(APP, image)));
        let mut agg = SampleAggregator::new(registry);

        let mmap = MmapRecord {
            base: 0x40_0000,
            size: 0x1000,
            off: 0,
            pid: Pid(10),
            tid: Tid(10),
            read: true,
            exec: true,
            dso: APP,
            ..Default::default()
        };
        let info = InfoSample { header: header(0), record: InfoRecord::Mmap(mmap) };
        assert!(agg.collect_mmap(&info));
        agg.finalize_mappings();
        agg
    }

    fn header(ts: u64) -> SampleHeader<'static> {
        SampleHeader { pid: Pid(10), tid: Tid(11), timestamp: Timestamp(ts), comm: "app" }
    }

    fn branch(from: u64, to: u64) -> LbrBranch<'static> {
        LbrBranch { from: SampleLoc::new(from, APP), to: SampleLoc::new(to, APP), ..Default::default() }
    }

    fn lbr(ip: u64, branches: &[LbrBranch<'static>]) -> LbrSample<'static> {
        let mut sample = LbrSample::default();
        sample.sample = SimpleSample { header: header(5), loc: SampleLoc::new(ip, APP) };
        sample.set_branches(branches);
        sample
    }

    #[test]
    fn test_collect_simple() {
        let mut agg = aggregator();
        let mut t = Telemetry::new();
        let mut sample = SimpleSample { header: header(5), loc: SampleLoc::new(0x40_0120, APP) };
        assert!(agg.collect_simple(&mut sample, &mut t));
        assert_eq!(sample.loc.unmapped_addr, 0x120);

        let mut unmapped = SimpleSample { header: header(5), loc: SampleLoc::new(0x90_0000, APP) };
        assert!(!agg.collect_simple(&mut unmapped, &mut t));

        assert_eq!(t.total_samples, 2);
        assert_eq!(t.total_tracked_samples, 1);
        assert_eq!(agg.func_total().num_samples, 1.0);
        assert!(agg.valid());
        let dso = agg.symbols().find_dso(APP, false).expect("dso");
        assert!(agg.symbols().dso(dso).comms().contains("app"));
    }

    #[test]
    fn test_collect_lbr_counts_calls() {
        let mut agg = aggregator();
        let mut t = Telemetry::new();
        let mut sample = lbr(0x40_0148, &[branch(0x40_0110, 0x40_0140), branch(0x40_0150, 0x40_0115)]);
        assert!(agg.collect_lbr(&mut sample, &mut t));

        assert_eq!(t.total_branches, 2);
        assert_eq!(t.total_tracked_branches, 2);
        // the call is trackable, the return is not
        assert_eq!(t.total_true_calls, 1);
        assert!((t.average_call_distance() - 0x30 as f64).abs() < f64::EPSILON);
        assert_eq!(t.total_insn_decoded, 2);
        assert_eq!(agg.edge_total().num_edges, 2.0);
        assert_eq!(agg.func_total().br_in, 2.0);
        assert!(agg.valid());

        let bucket = &agg.tpids()[&lbrgraph_common::tpid(10, 11)];
        assert_eq!(bucket.edges().len(), 2);
    }

    #[test]
    fn test_unresolved_branch_is_skipped() {
        let mut agg = aggregator();
        let mut t = Telemetry::new();
        let mut sample = lbr(0x40_0148, &[branch(0x40_0110, 0x40_0140), branch(0x77_0000, 0x40_0115)]);
        assert!(agg.collect_lbr(&mut sample, &mut t));
        assert_eq!(t.total_branches, 2);
        assert_eq!(t.total_tracked_branches, 1);
        assert_eq!(agg.edge_total().num_edges, 1.0);
        assert!(agg.valid());
    }

    #[test]
    fn test_invalid_sample_poisons_validity() {
        let mut agg = aggregator();
        let mut t = Telemetry::new();
        let mut empty = lbr(0x40_0148, &[]);
        assert!(!agg.collect_lbr(&mut empty, &mut t));
        assert_eq!(agg.skipped(), 1);
        assert!(!agg.valid());
    }

    #[test]
    fn test_filter_collapses_buckets() {
        let mut agg = aggregator();
        let mut t = Telemetry::new();
        let mut a = lbr(0x40_0148, &[branch(0x40_0110, 0x40_0140)]);
        let mut b = lbr(0x40_0148, &[branch(0x40_0110, 0x40_0140)]);
        b.sample.header.tid = Tid(12);
        agg.collect_lbr(&mut a, &mut t);
        agg.collect_lbr(&mut b, &mut t);
        assert_eq!(agg.tpids().len(), 2);

        let (funcs, edges) = agg.filter(&AcceptAll, &AcceptAll);
        assert_eq!(funcs.len(), 2);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].stats.num_edges, 2.0);
        let helper = funcs.iter().find(|f| agg.symbols().clump(f.clump).name() == "helper").expect("helper");
        assert_eq!(helper.stats.num_samples, 2.0);
        assert_eq!(helper.stats.br_in, 2.0);
    }

    #[test]
    fn test_add_merges_buckets() {
        let mut agg = aggregator();
        let mut t = Telemetry::new();
        let mut a = lbr(0x40_0148, &[branch(0x40_0110, 0x40_0140)]);
        agg.collect_lbr(&mut a, &mut t);

        let bucket = agg.tpids()[&lbrgraph_common::tpid(10, 11)].clone();
        agg.add(lbrgraph_common::tpid(10, 11), &bucket);
        agg.add(lbrgraph_common::tpid(20, 20), &bucket);
        assert_eq!(agg.edge_total().num_edges, 3.0);
        assert!(agg.valid());
    }
}
