//! Save states
//!
//! A save state is the clumped call graph of one run written as JSON, so
//! that profiles from several runs (or several machines) can be combined
//! later without re-reading the traces.
//!
//! ```text
//!   { version, scaling, telemetry,
//!     dsos:   [ { name, findable, comms } ],
//!     clumps: [ { dso, funcs, size, contiguous, unknown } ],   dso   -> dsos[i]
//!     funcs:  [ { clump, stats } ],                            clump -> clumps[i]
//!     edges:  [ { from, to, branch, stats } ] }
//! ```
//!
//! Reloaded DSOs and clumps are interned in the registry like live ones, so
//! the same function saved by two runs reloads as one clump and its stats
//! are summed.

use crate::analysis::{CallGraph, EdgeStats, FuncStats, PerfEdge, PerfFunc};
use crate::domain::errors::StateError;
use crate::symbols::{ClumpId, DsoId, Func, FuncClump, SymbolRegistry};
use crate::telemetry::Telemetry;
use lbrgraph_common::BranchInsn;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

pub const STATE_VERSION: u32 = 1;

/// Total function samples after normalization (2^20)
pub const FUNC_SCALE_POINT: f64 = 1_048_576.0;

/// Total edge weight after normalization (2^30)
pub const EDGE_SCALE_POINT: f64 = 1_073_741_824.0;

/// Scale factors above this are almost certainly a typo
const LARGE_SCALE_FACTOR: f64 = 1_000_000.0;

// ============================================================================
// Scaling
// ============================================================================

/// How stats are rescaled on save and reload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaling {
    normalize: bool,
    add_scale: Option<f64>,
}

impl Default for Scaling {
    fn default() -> Self {
        Self { normalize: true, add_scale: None }
    }
}

impl Scaling {
    /// `add_scale` must be positive and finite
    pub fn new(normalize: bool, add_scale: Option<f64>) -> Result<Self, StateError> {
        if let Some(v) = add_scale {
            if !v.is_finite() || v <= 0.0 {
                return Err(StateError::InvalidScale(v));
            }
            if v > LARGE_SCALE_FACTOR {
                warn!("Custom scale factor is very high: {v}");
            }
        }
        Ok(Self { normalize, add_scale })
    }

    /// Leave stats exactly as collected
    #[must_use]
    pub fn none() -> Self {
        Self { normalize: false, add_scale: None }
    }

    #[must_use]
    pub fn normalizes(&self) -> bool {
        self.normalize
    }

    #[must_use]
    pub fn add_scale(&self) -> Option<f64> {
        self.add_scale
    }

    /// Factors that bring `funcs` and `edges` to the scale points (when
    /// normalizing), times the added scale
    fn factors(&self, funcs: &[PerfFunc], edges: &[PerfEdge]) -> (f64, f64) {
        let extra = self.add_scale.unwrap_or(1.0);
        if !self.normalize {
            return (extra, extra);
        }
        let func_total: f64 = funcs.iter().map(|f| f.stats.num_samples).sum();
        let edge_total: f64 = edges.iter().map(|e| e.stats.num_edges).sum();
        (normalizer(FUNC_SCALE_POINT, func_total) * extra, normalizer(EDGE_SCALE_POINT, edge_total) * extra)
    }
}

fn normalizer(point: f64, total: f64) -> f64 {
    if total > 0.0 {
        point / total
    } else {
        1.0
    }
}

// ============================================================================
// Document
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedScaling {
    pub func_normalized: bool,
    pub edge_normalized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedDso {
    pub name: String,
    #[serde(default)]
    pub findable: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub comms: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedClump {
    pub dso: usize,
    pub funcs: Vec<Func>,
    pub size: u64,
    #[serde(default = "default_true")]
    pub contiguous: bool,
    #[serde(default)]
    pub unknown: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SavedFunc {
    pub clump: usize,
    pub stats: FuncStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SavedEdge {
    pub from: usize,
    pub to: usize,
    /// Branch table index
    pub branch: u16,
    pub stats: EdgeStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedState {
    pub version: u32,
    #[serde(default)]
    pub scaling: SavedScaling,
    #[serde(default)]
    pub telemetry: Telemetry,
    pub dsos: Vec<SavedDso>,
    pub clumps: Vec<SavedClump>,
    pub funcs: Vec<SavedFunc>,
    #[serde(default)]
    pub edges: Vec<SavedEdge>,
}

impl SavedState {
    /// Snapshot `graph`, keeping only the DSOs and clumps it references
    #[must_use]
    pub fn capture(graph: &CallGraph, registry: &SymbolRegistry, scaling: &Scaling, telemetry: &Telemetry) -> Self {
        let mut dso_slots: HashMap<DsoId, usize> = HashMap::new();
        let mut clump_slots: HashMap<ClumpId, usize> = HashMap::new();
        let mut dsos = Vec::new();
        let mut clumps = Vec::new();

        let mut slot_of = |id: ClumpId| -> usize {
            *clump_slots.entry(id).or_insert_with(|| {
                let clump = registry.clump(id);
                let dso = *dso_slots.entry(clump.dso()).or_insert_with(|| {
                    let d = registry.dso(clump.dso());
                    dsos.push(SavedDso { name: d.name().to_string(), findable: d.is_findable(), comms: d.comms().clone() });
                    dsos.len() - 1
                });
                clumps.push(SavedClump {
                    dso,
                    funcs: clump.funcs().to_vec(),
                    size: clump.size(),
                    contiguous: clump.is_contiguous(),
                    unknown: clump.is_unknown(),
                });
                clumps.len() - 1
            })
        };

        let (func_scale, edge_scale) = scaling.factors(graph.funcs(), graph.edges());
        let funcs: Vec<SavedFunc> = graph
            .funcs()
            .iter()
            .map(|f| {
                let mut stats = f.stats;
                stats.scale(func_scale, edge_scale);
                SavedFunc { clump: slot_of(f.clump), stats }
            })
            .collect();
        let edges: Vec<SavedEdge> = graph
            .edges()
            .iter()
            .map(|e| {
                let mut stats = e.stats;
                stats.scale(edge_scale);
                SavedEdge { from: slot_of(e.from), to: slot_of(e.to), branch: e.branch.index(), stats }
            })
            .collect();

        Self {
            version: STATE_VERSION,
            scaling: SavedScaling {
                func_normalized: scaling.normalize && !graph.funcs().is_empty(),
                edge_normalized: scaling.normalize && !graph.edges().is_empty(),
                scale: scaling.add_scale,
            },
            telemetry: telemetry.clone(),
            dsos,
            clumps,
            funcs,
            edges,
        }
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self, StateError> {
        let state: SavedState = serde_json::from_reader(reader)?;
        if state.version != STATE_VERSION {
            return Err(StateError::VersionMismatch { found: state.version, expected: STATE_VERSION });
        }
        Ok(state)
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), StateError> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    fn total_samples(&self) -> f64 {
        self.funcs.iter().map(|f| f.stats.num_samples).sum()
    }

    fn total_edges(&self) -> f64 {
        self.edges.iter().map(|e| e.stats.num_edges).sum()
    }
}

// ============================================================================
// Save
// ============================================================================

/// Write `graph` as a save state
pub fn save_state<W: Write>(
    mut writer: W,
    graph: &CallGraph,
    registry: &SymbolRegistry,
    scaling: &Scaling,
    telemetry: &Telemetry,
) -> Result<(), StateError> {
    let state = SavedState::capture(graph, registry, scaling, telemetry);
    state.write_to(&mut writer)?;
    writer.flush()?;
    info!("Saved {} functions and {} edges", state.funcs.len(), state.edges.len());
    Ok(())
}

// ============================================================================
// Reload
// ============================================================================

/// Accumulates any number of save states into one graph
#[derive(Debug)]
pub struct StateReloader<'a> {
    registry: &'a mut SymbolRegistry,
    scaling: Scaling,
    funcs: HashMap<ClumpId, FuncStats>,
    edges: HashMap<(ClumpId, ClumpId, BranchInsn), EdgeStats>,
}

impl<'a> StateReloader<'a> {
    pub fn new(registry: &'a mut SymbolRegistry, scaling: Scaling) -> Self {
        Self { registry, scaling, funcs: HashMap::new(), edges: HashMap::new() }
    }

    /// Intern one document's DSOs and clumps and add its stats
    pub fn add_state(&mut self, origin: &Path, state: SavedState, telemetry: &mut Telemetry) -> Result<(), StateError> {
        if state.funcs.is_empty() {
            return Err(StateError::Empty(origin.to_path_buf()));
        }
        if state.scaling.func_normalized && !self.scaling.normalize {
            warn!("{} was normalized when saved; its weights are not raw sample counts", origin.display());
        }

        let dsos: Vec<DsoId> = state
            .dsos
            .iter()
            .map(|saved| {
                let id = self.registry.get_reloaded_dso(&saved.name, telemetry);
                let dso = self.registry.dso_mut(id);
                if saved.findable {
                    dso.set_findable(true);
                }
                for comm in &saved.comms {
                    dso.add_comm(comm);
                }
                id
            })
            .collect();

        let mut clumps = Vec::with_capacity(state.clumps.len());
        for (index, saved) in state.clumps.iter().enumerate() {
            let dso = *dsos.get(saved.dso).ok_or(StateError::DanglingIndex { kind: "dso", index: saved.dso })?;
            if saved.funcs.is_empty() {
                debug!("Clump {index} of {} has no functions", origin.display());
                return Err(StateError::DanglingIndex { kind: "function", index });
            }
            let mut clump = FuncClump::reloaded(dso, saved.funcs.clone(), saved.size, saved.contiguous);
            if saved.unknown {
                clump.mark_unknown();
            }
            clumps.push(self.registry.intern_clump(clump));
        }
        let clump_at =
            |index: usize| clumps.get(index).copied().ok_or(StateError::DanglingIndex { kind: "clump", index });

        let (func_scale, edge_scale) = self.reload_factors(&state);
        for saved in &state.funcs {
            let mut stats = saved.stats;
            stats.scale(func_scale, edge_scale);
            self.funcs.entry(clump_at(saved.clump)?).or_default().add(&stats);
        }
        for saved in &state.edges {
            let (from, to) = (clump_at(saved.from)?, clump_at(saved.to)?);
            if from == to {
                debug!("Dropping reloaded self edge on {}", self.registry.clump(from));
                continue;
            }
            let mut stats = saved.stats;
            stats.scale(edge_scale);
            self.edges.entry((from, to, BranchInsn::from_index(saved.branch))).or_default().add(&stats);
        }

        telemetry.merge(&state.telemetry);
        info!(
            "Reloaded {} functions and {} edges from {}",
            state.funcs.len(),
            state.edges.len(),
            origin.display()
        );
        Ok(())
    }

    /// Inputs are brought to the scale points one by one so every run
    /// carries the same weight in the sum
    fn reload_factors(&self, state: &SavedState) -> (f64, f64) {
        let extra = self.scaling.add_scale.unwrap_or(1.0);
        if !self.scaling.normalize {
            return (extra, extra);
        }
        let func = if state.scaling.func_normalized { 1.0 } else { normalizer(FUNC_SCALE_POINT, state.total_samples()) };
        let edge = if state.scaling.edge_normalized { 1.0 } else { normalizer(EDGE_SCALE_POINT, state.total_edges()) };
        (func * extra, edge * extra)
    }

    /// Sorted functions and edges of everything added so far
    #[must_use]
    pub fn finish(self) -> CallGraph {
        let mut funcs: Vec<PerfFunc> = self.funcs.into_iter().map(|(clump, stats)| PerfFunc { clump, stats }).collect();
        funcs.sort_by_key(|f| f.clump);
        let mut edges: Vec<PerfEdge> =
            self.edges.into_iter().map(|((from, to, branch), stats)| PerfEdge { from, to, branch, stats }).collect();
        edges.sort_by_key(PerfEdge::key);
        CallGraph::new(funcs, edges)
    }
}

/// Reload and combine the save states at `paths`
pub fn reload_states(
    paths: &[PathBuf],
    registry: &mut SymbolRegistry,
    scaling: Scaling,
    telemetry: &mut Telemetry,
) -> Result<CallGraph, StateError> {
    info!("Processing {} input states", paths.len());
    let mut reloader = StateReloader::new(registry, scaling);
    for path in paths {
        let state = SavedState::read_from(BufReader::new(File::open(path)?))?;
        reloader.add_state(path, state, telemetry)?;
    }
    Ok(reloader.finish())
}

/// Split a `--reload` argument (`a.json,b.json`) into paths
#[must_use]
pub fn split_reload_list(list: &str) -> Vec<PathBuf> {
    list.split(',').map(str::trim).filter(|p| !p.is_empty()).map(PathBuf::from).collect()
}
