//! # lbrgraph - Main Entry Point
//!
//! Two input modes, one set of outputs:
//! - **Trace** (`--perf`, `--map`, `--root`): run the info and event passes
//!   over `perf script` output and clump the result
//! - **Reload** (`--reload a.json,b.json`): combine earlier save states
//!
//! Either graph can then be written as JSON (`--out`), DOT (`--dot`) and/or
//! a new save state (`--save`).

use anyhow::{bail, Context, Result};
use clap::Parser;
use lbrgraph::analysis::{AcceptAll, CallGraph, Clumper, Findable, FunctionOrderClumper, SampleAggregator};
use lbrgraph::cli::Args;
use lbrgraph::domain::ExportError;
use lbrgraph::export::{create_output, reload_states, save_state, split_reload_list, write_dot, write_graph_json, Scaling};
use lbrgraph::ingest::{
    collect_events, collect_info, is_perf_data, resolve_input, TraceInput, TraceKind, EVENT_DEFAULTS, INFO_DEFAULTS,
};
use lbrgraph::symbols::{ElfLoader, SymbolRegistry};
use lbrgraph::telemetry::Telemetry;
use log::{info, warn};
use std::io::Write;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("missing required argument") || msg.contains("invalid scale factor") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn init_logging(args: &Args) {
    env_logger::Builder::new().filter_level(args.log_level()).parse_default_env().init();
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);
    args.validate()?;

    let normalize = !args.no_normalize;
    let scaling = Scaling::new(normalize, args.add_scale)?;
    let mut telemetry = Telemetry::new();

    let (graph, registry) = if let Some(list) = &args.reload {
        if args.root.is_some() || args.perf.is_some() || args.map.is_some() {
            warn!("Ignoring --root/--perf/--map arguments; only using save states");
        }
        let paths = split_reload_list(list);
        if paths.is_empty() {
            bail!("Missing required argument: --reload names no files");
        }
        let mut registry = SymbolRegistry::without_images();
        // The added scale is applied once, when saving
        let graph = reload_states(&paths, &mut registry, Scaling::new(normalize, None)?, &mut telemetry)
            .context("Unable to reload save states")?;
        // States clumped in different runs may still overlap each other
        let (mut funcs, mut edges) = graph.into_parts();
        FunctionOrderClumper.clump(&mut registry, &mut funcs, &mut edges, &mut telemetry);
        (CallGraph::new(funcs, edges), registry)
    } else {
        collect_graph(&args, &mut telemetry)?
    };

    if graph.funcs().is_empty() || graph.edges().is_empty() {
        bail!(
            "No functions ({}) or edges ({}) from profile; the traces probably do not match",
            graph.funcs().len(),
            graph.edges().len()
        );
    }
    info!(
        "Call graph: {} functions ({:.0} samples), {} edges ({:.0} weight)",
        graph.funcs().len(),
        graph.total_samples(),
        graph.edges().len(),
        graph.total_edge_weight()
    );
    telemetry.log_summary();

    if let Some(path) = &args.save {
        let writer = create_output(path, args.overwrite)?;
        save_state(writer, &graph, &registry, &scaling, &telemetry)
            .with_context(|| format!("Error saving state to {}", path.display()))?;
    }

    if args.out.is_none() && args.dot.is_none() {
        return Ok(());
    }
    if !graph.valid(&registry) {
        return Err(ExportError::InvalidGraph.into());
    }

    if let Some(path) = &args.out {
        let mut writer = create_output(path, args.overwrite)?;
        write_graph_json(&mut writer, &graph, &registry)
            .with_context(|| format!("Error writing graph to {}", path.display()))?;
        writer.flush()?;
    }

    if let Some(path) = &args.dot {
        let dso = args.dot_dso.as_deref().and_then(|name| {
            let found = registry.find_dso(name, false).or_else(|| registry.find_dso(name, true));
            if found.is_none() {
                warn!("Unable to find DOT DSO {name}; writing the whole graph");
            }
            found
        });
        let mut writer = create_output(path, args.overwrite)?;
        write_dot(&mut writer, &graph, &registry, dso)
            .with_context(|| format!("Error writing DOT file {}", path.display()))?;
        writer.flush()?;
    }

    Ok(())
}

/// Run both trace passes and clump the result
fn collect_graph(args: &Args, telemetry: &mut Telemetry) -> Result<(CallGraph, SymbolRegistry)> {
    let root = args.root.as_deref();
    let Some(perf) = resolve_input(args.perf.as_deref(), root, EVENT_DEFAULTS) else {
        bail!("Missing required argument: no perf events file given or found under --root");
    };
    let map = match args.map.as_deref() {
        Some(map) => map.to_path_buf(),
        None if is_perf_data(&perf) => {
            warn!("Defaulting to {} as the info events file", perf.display());
            perf.clone()
        }
        None => resolve_input(None, root, INFO_DEFAULTS)
            .context("Missing required argument: no info events file given or found under --root")?,
    };

    let registry = SymbolRegistry::new(Box::new(ElfLoader::new(args.root.clone())));
    let mut aggregator = SampleAggregator::new(registry);

    let input = TraceInput::open(&map, TraceKind::Info)?;
    collect_info(input, &mut aggregator, telemetry)
        .with_context(|| format!("Error collecting mappings from {}", map.display()))?;
    if args.dump {
        aggregator.mappings().log_dump();
    }

    let input = TraceInput::open(&perf, TraceKind::Events)?;
    collect_events(input, &mut aggregator, telemetry)
        .with_context(|| format!("Error collecting samples from {}", perf.display()))?;

    let graph = if args.findable_only {
        aggregator.filter_and_clump(&Findable, &Findable, &FunctionOrderClumper, telemetry)
    } else {
        aggregator.filter_and_clump(&AcceptAll, &AcceptAll, &FunctionOrderClumper, telemetry)
    };
    Ok((graph, aggregator.into_symbols()))
}
