//! Call graph output for layout tools
//!
//! Two formats:
//!
//! - JSON (`write_graph_json`): one object per node and per edge, with the
//!   demangled label and the raw constituent names
//! - DOT (`write_dot`): a Graphviz digraph, optionally restricted to the
//!   nodes of one DSO plus their direct neighbours

// Sample weights are f64 and printed rounded in DOT labels
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::analysis::CallGraph;
use crate::domain::errors::ExportError;
use crate::symbols::{ClumpId, DsoId, SymbolRegistry};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Serialize)]
struct GraphNode {
    id: usize,
    dso: String,
    label: String,
    names: Vec<String>,
    lo: u64,
    hi: u64,
    size: u64,
    samples: f64,
    tracked_in: f64,
    tracked_out: f64,
    br_in: f64,
    br_out: f64,
}

#[derive(Debug, Serialize)]
struct GraphEdge {
    from: usize,
    to: usize,
    branch: &'static str,
    weight: f64,
}

#[derive(Debug, Serialize)]
struct GraphDocument {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
}

impl GraphDocument {
    fn build(graph: &CallGraph, registry: &SymbolRegistry) -> Self {
        let nodes = graph
            .funcs()
            .iter()
            .map(|f| {
                let clump = registry.clump(f.clump);
                GraphNode {
                    id: f.clump.index(),
                    dso: registry.dso(clump.dso()).name().to_string(),
                    label: clump.label(),
                    names: clump.funcs().iter().map(|func| func.name.clone()).collect(),
                    lo: clump.range().lo,
                    hi: clump.range().hi,
                    size: clump.size(),
                    samples: f.stats.num_samples,
                    tracked_in: f.stats.tracked_in,
                    tracked_out: f.stats.tracked_out,
                    br_in: f.stats.br_in,
                    br_out: f.stats.br_out,
                }
            })
            .collect();
        let edges = graph
            .edges()
            .iter()
            .map(|e| GraphEdge {
                from: e.from.index(),
                to: e.to.index(),
                branch: e.branch.name(),
                weight: e.stats.num_edges,
            })
            .collect();
        Self { nodes, edges }
    }
}

/// Write `graph` as pretty-printed JSON
pub fn write_graph_json<W: Write>(writer: W, graph: &CallGraph, registry: &SymbolRegistry) -> Result<(), ExportError> {
    let doc = GraphDocument::build(graph, registry);
    serde_json::to_writer_pretty(writer, &doc)?;
    Ok(())
}

/// Write `graph` as a Graphviz digraph
///
/// With `dso` set, only that DSO's nodes are emitted (`in=1`) together with
/// the outside nodes they call or are called from (`in=0`), and only edges
/// between emitted nodes.
pub fn write_dot<W: Write>(
    mut writer: W,
    graph: &CallGraph,
    registry: &SymbolRegistry,
    dso: Option<DsoId>,
) -> Result<(), ExportError> {
    let in_dso = |id: ClumpId| dso.is_none_or(|d| registry.clump(id).dso() == d);

    let mut shown: BTreeSet<ClumpId> = graph.funcs().iter().map(|f| f.clump).filter(|&id| in_dso(id)).collect();
    let inside: HashSet<ClumpId> = shown.iter().copied().collect();
    if dso.is_some() {
        for e in graph.edges() {
            if inside.contains(&e.from) || inside.contains(&e.to) {
                shown.insert(e.from);
                shown.insert(e.to);
            }
        }
    }

    writeln!(writer, "digraph g {{")?;
    for &id in &shown {
        let clump = registry.clump(id);
        let samples = graph.func(id).map_or(0.0, |f| f.stats.num_samples);
        let label = escape(&clump.label());
        if dso.is_some() {
            let inside = u8::from(inside.contains(&id));
            writeln!(
                writer,
                "f{} [label=\"{label}\\nin={inside}\\nsamples={}\\nsize={}\"];",
                id.index(),
                samples.round() as u64,
                clump.size()
            )?;
        } else {
            writeln!(
                writer,
                "f{} [label=\"{label}\\nsamples={}\\nsize={}\"];",
                id.index(),
                samples.round() as u64,
                clump.size()
            )?;
        }
    }
    for e in graph.edges().iter().filter(|e| shown.contains(&e.from) && shown.contains(&e.to)) {
        writeln!(
            writer,
            "f{} -> f{} [label=\"weight={}\"];",
            e.from.index(),
            e.to.index(),
            e.stats.num_edges.round() as u64
        )?;
    }
    writeln!(writer, "}}")?;
    Ok(())
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Open `path` for writing, refusing to clobber an existing file unless
/// `overwrite` is set
pub fn create_output(path: &Path, overwrite: bool) -> Result<BufWriter<File>, ExportError> {
    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    match options.open(path) {
        Ok(file) => Ok(BufWriter::new(file)),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(ExportError::WouldOverwrite(path.to_path_buf())),
        Err(e) => Err(e.into()),
    }
}
