//! Function clumping
//!
//! Turns the filtered function and edge lists into call-graph form:
//!
//! 1. Sort functions by DSO, then address range.
//! 2. Merge functions whose constituent ranges overlap an earlier survivor.
//! 3. Merge clumps sharing a `(DSO, name, ident)` until nothing changes.
//! 4. Re-key edges onto the surviving clumps; drop self edges and branches
//!    that are not calls or tail calls, and sum duplicates.
//! 5. Recompute tracked in/out from the surviving edges and drop the
//!    absorbed functions.
//!
//! Merges happen in place in the [`SymbolRegistry`], so the absorbing clump
//! grows and the absorbed one stays allocated but unreferenced.

use super::stats::{PerfEdge, PerfFunc};
use crate::symbols::{ClumpId, DsoId, Ident, SymbolRegistry};
use crate::telemetry::Telemetry;
use log::trace;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

pub trait Clumper {
    fn clump(
        &self,
        registry: &mut SymbolRegistry,
        funcs: &mut Vec<PerfFunc>,
        edges: &mut Vec<PerfEdge>,
        telemetry: &mut Telemetry,
    );
}

/// Leave the lists as filtered
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClumping;

impl Clumper for NoClumping {
    fn clump(&self, _: &mut SymbolRegistry, _: &mut Vec<PerfFunc>, _: &mut Vec<PerfEdge>, _: &mut Telemetry) {}
}

/// Clumping for function ordering; see the module docs for the steps
#[derive(Debug, Default, Clone, Copy)]
pub struct FunctionOrderClumper;

type NameKey = (DsoId, String, Ident);

impl Clumper for FunctionOrderClumper {
    fn clump(
        &self,
        registry: &mut SymbolRegistry,
        funcs: &mut Vec<PerfFunc>,
        edges: &mut Vec<PerfEdge>,
        telemetry: &mut Telemetry,
    ) {
        funcs.sort_by_key(|f| {
            let clump = registry.clump(f.clump);
            (clump.dso(), clump.range(), f.clump)
        });
        telemetry.total_funcs += funcs.len() as u64;
        telemetry.total_edges += edges.len() as u64;

        let index: HashMap<ClumpId, usize> = funcs.iter().enumerate().map(|(i, f)| (f.clump, i)).collect();
        let mut remap: Vec<usize> = (0..funcs.len()).collect();

        merge_overlapping(registry, funcs, &mut remap);
        merge_same_names(registry, funcs, &mut remap);
        let root = |mut i: usize| {
            while remap[i] != i {
                i = remap[i];
            }
            i
        };

        // Edges onto surviving clumps, first trackable branch kept per pair
        let mut kept: Vec<PerfEdge> = Vec::with_capacity(edges.len());
        let mut by_pair: HashMap<(ClumpId, ClumpId), usize> = HashMap::new();
        for edge in edges.drain(..) {
            if edge.from == edge.to || !edge.branch.is_trackable_call() {
                continue;
            }
            let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to)) else {
                continue;
            };
            let (from, to) = (funcs[root(from)].clump, funcs[root(to)].clump);
            if from == to {
                continue;
            }
            match by_pair.entry((from, to)) {
                Entry::Occupied(slot) => kept[*slot.get()].stats.add(&edge.stats),
                Entry::Vacant(slot) => {
                    slot.insert(kept.len());
                    kept.push(PerfEdge { from, to, ..edge });
                }
            }
        }
        *edges = kept;

        for func in funcs.iter_mut() {
            func.stats.tracked_in = 0.0;
            func.stats.tracked_out = 0.0;
        }
        for edge in edges.iter() {
            funcs[index[&edge.from]].stats.tracked_out += edge.stats.num_edges;
            funcs[index[&edge.to]].stats.tracked_in += edge.stats.num_edges;
        }

        let mut i = 0;
        funcs.retain(|_| {
            let keep = remap[i] == i;
            i += 1;
            keep
        });

        telemetry.total_clumped_funcs += funcs.len() as u64;
        telemetry.total_tracked_edges += edges.len() as u64;
    }
}

/// Step 2: sweep in address order
///
/// A survivor stays active while its span reaches the current function. Name
/// merged clumps from earlier runs are not contiguous, so any active survivor
/// can overlap, not just the last one.
fn merge_overlapping(registry: &mut SymbolRegistry, funcs: &mut [PerfFunc], remap: &mut [usize]) {
    let mut active: Vec<usize> = Vec::new();
    for i in 0..funcs.len() {
        let current = registry.clump(funcs[i].clump);
        let (dso, lo) = (current.dso(), current.range().lo);
        active.retain(|&a| {
            let survivor = registry.clump(funcs[a].clump);
            survivor.dso() == dso && survivor.range().end() > lo
        });

        let hits: Vec<usize> =
            active.iter().copied().filter(|&a| registry.clump(funcs[a].clump).overlaps(current)).collect();
        let Some((&target, rest)) = hits.split_first() else {
            active.push(i);
            continue;
        };
        trace!("Address merge {} <- {}", registry.clump(funcs[target].clump), registry.clump(funcs[i].clump));
        absorb(registry, funcs, target, i);
        remap[i] = target;
        // `i` bridged these survivors to the target
        for &other in rest {
            trace!("Address merge {} <- {}", registry.clump(funcs[target].clump), registry.clump(funcs[other].clump));
            absorb(registry, funcs, target, other);
            remap[other] = target;
        }
        active.retain(|a| !rest.contains(a));
    }
}

/// Step 3: fixed point over name merges with path compression
fn merge_same_names(registry: &mut SymbolRegistry, funcs: &mut [PerfFunc], remap: &mut [usize]) {
    let mut by_name: HashMap<NameKey, usize> = HashMap::new();
    for i in (0..funcs.len()).filter(|&i| remap[i] == i) {
        for key in name_keys(registry, funcs[i].clump) {
            by_name.entry(key).or_insert(i);
        }
    }

    loop {
        let mut changed = false;
        for i in 0..funcs.len() {
            if remap[i] != i {
                let next = remap[remap[i]];
                if next != remap[i] {
                    remap[i] = next;
                    changed = true;
                }
                continue;
            }

            let target = name_keys(registry, funcs[i].clump)
                .into_iter()
                .find_map(|key| by_name.get(&key).copied().filter(|&t| t != i));
            let Some(target) = target else {
                continue;
            };
            trace!("Name merge {} <- {}", registry.clump(funcs[target].clump), registry.clump(funcs[i].clump));
            absorb(registry, funcs, target, i);
            remap[i] = target;
            for key in name_keys(registry, funcs[target].clump) {
                by_name.insert(key, target);
            }
            changed = true;
        }
        if !changed {
            break;
        }
    }
}

fn absorb(registry: &mut SymbolRegistry, funcs: &mut [PerfFunc], dst: usize, src: usize) {
    registry.merge_clumps(funcs[dst].clump, funcs[src].clump);
    let stats = funcs[src].stats;
    funcs[dst].stats.add(&stats);
}

/// Unknown functions share one name, so a DSO's unknown clumps become one node
fn name_keys(registry: &SymbolRegistry, clump: ClumpId) -> Vec<NameKey> {
    let clump = registry.clump(clump);
    clump
        .funcs()
        .iter()
        .map(|f| (clump.dso(), f.name.clone(), f.ident.clone()))
        .collect()
}
