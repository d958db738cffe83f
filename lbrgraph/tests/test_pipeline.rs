use lbrgraph::analysis::{AcceptAll, CallGraph, Clumper, FunctionOrderClumper, SampleAggregator};
use lbrgraph::ingest::{collect_events, collect_info, TraceInput, TraceKind};
use lbrgraph::symbols::{FuncSymbol, MemoryImage, MemoryLoader, SymbolRegistry};
use lbrgraph::telemetry::Telemetry;
use std::io::{Cursor, Write};

const INFO: &str = "\
app 10/10 1.000001: PERF_RECORD_MMAP2 10/10: [0x400000(0x1000) @ 0 08:01 42 0]: r-xp /bin/app
app 10/10 1.000002: PERF_RECORD_COMM exec: app:10/10
app 10/10 1.000003: PERF_RECORD_FORK(20:20):(10:10)
";

// main (0x100) calls foo twice (two copies at 0x200 and 0x300) and bar
// (0x400, aliased by bar_alias at 0x410); 0x120 is a jump to itself.
const EVENTS: &str = "\
app 10/11 1.000010: 400120 (/bin/app)
app 10/11 1.000011: 400205 (/bin/app) 0x400110(/bin/app)/0x400200(/bin/app)/P/-/-/1 0x400110(/bin/app)/0x400300(/bin/app)/P/-/-/2
app 10/12 1.000012: 400405 (/bin/app) 0x400110(/bin/app)/0x400400(/bin/app)/M/-/-/1 0x400120(/bin/app)/0x400120(/bin/app)/P/-/-/1
app 20/20 1.000013: 400305 (/bin/app)
";

fn loader() -> MemoryLoader {
    let image = MemoryImage::new(vec![
        FuncSymbol::new("main", 0x100, 0x140),
        FuncSymbol::new("foo", 0x200, 0x210),
        FuncSymbol::new("foo", 0x300, 0x310),
        FuncSymbol::new("bar", 0x400, 0x420),
        FuncSymbol::new("bar_alias", 0x410, 0x430),
    ])
    .with_bytes(0x110, &[0xe8, 0x00, 0x00, 0x00, 0x00])
    .with_bytes(0x120, &[0xeb, 0xfe]);
    MemoryLoader::new().with_image("/bin/app", image)
}

fn text(name: &str, body: &str) -> TraceInput {
    TraceInput::from_reader(name, Cursor::new(body.as_bytes().to_vec()))
}

fn collect(info: TraceInput, events: TraceInput, telemetry: &mut Telemetry) -> SampleAggregator {
    let mut agg = SampleAggregator::new(SymbolRegistry::new(Box::new(loader())));
    collect_info(info, &mut agg, telemetry).expect("info pass");
    collect_events(events, &mut agg, telemetry).expect("event pass");
    agg
}

fn build_graph() -> (CallGraph, SampleAggregator, Telemetry) {
    let mut telemetry = Telemetry::new();
    let mut agg = collect(text("info", INFO), text("events", EVENTS), &mut telemetry);
    let graph = agg.filter_and_clump(&AcceptAll, &AcceptAll, &FunctionOrderClumper, &mut telemetry);
    (graph, agg, telemetry)
}

fn node_named<'a>(graph: &'a CallGraph, registry: &SymbolRegistry, name: &str) -> &'a lbrgraph::analysis::PerfFunc {
    graph
        .funcs()
        .iter()
        .find(|f| registry.clump(f.clump).name() == name)
        .unwrap_or_else(|| panic!("no node named {name}"))
}

#[test]
fn test_end_to_end_graph() {
    let (graph, agg, telemetry) = build_graph();
    let reg = agg.symbols();

    assert!(graph.valid(reg), "clumped graph should validate");
    assert_eq!(graph.funcs().len(), 3, "main, foo (two copies), bar (with alias)");
    assert_eq!(graph.edges().len(), 2);

    let main = node_named(&graph, reg, "main");
    let foo = node_named(&graph, reg, "foo");
    let bar = node_named(&graph, reg, "bar");
    assert_eq!(reg.clump(foo.clump).size(), 0x20);
    assert_eq!(reg.clump(bar.clump).size(), 0x30);

    let weight = |to| graph.edges().iter().find(|e| e.from == main.clump && e.to == to).map(|e| e.stats.num_edges);
    assert_eq!(weight(foo.clump), Some(2.0));
    assert_eq!(weight(bar.clump), Some(1.0));
    assert_eq!(main.stats.tracked_out, 3.0);
    assert_eq!(foo.stats.tracked_in, 2.0);

    assert_eq!(telemetry.total_samples, 4);
    assert_eq!(telemetry.total_branches, 4);
    assert_eq!(telemetry.total_true_calls, 3);
    assert_eq!(telemetry.total_mappings, 1);
}

#[test]
fn test_forked_child_resolves_through_parent_mappings() {
    let (graph, agg, _) = build_graph();
    // pid 20 only has the mappings copied from pid 10
    assert!(agg.tpids().contains_key(&lbrgraph_common::tpid(20, 20)));
    let foo = node_named(&graph, agg.symbols(), "foo");
    assert!(foo.stats.num_samples >= 2.0);
}

#[test]
fn test_self_loops_never_become_edges() {
    let (graph, _, _) = build_graph();
    assert!(graph.edges().iter().all(|e| e.from != e.to));
}

#[test]
fn test_bucket_totals_match_aggregate() {
    let (_, agg, _) = build_graph();
    assert!(agg.valid());
    assert_eq!(agg.tpids().len(), 3);

    let samples: f64 = agg.tpids().values().map(|b| b.func_total().num_samples).sum();
    let edges: f64 = agg.tpids().values().map(|b| b.edge_total().num_edges).sum();
    assert_eq!(samples, agg.func_total().num_samples);
    assert_eq!(edges, agg.edge_total().num_edges);
    assert_eq!(agg.func_total().br_in, agg.edge_total().num_edges);
    assert_eq!(agg.func_total().br_out, agg.func_total().br_in);
}

#[test]
fn test_clumping_is_idempotent() {
    let (graph, mut agg, _) = build_graph();
    let (mut funcs, mut edges) = graph.clone().into_parts();
    let mut telemetry = Telemetry::new();
    FunctionOrderClumper.clump(agg.symbols_mut(), &mut funcs, &mut edges, &mut telemetry);

    let mut before = graph.into_parts();
    before.0.sort_by_key(|f| f.clump);
    funcs.sort_by_key(|f| f.clump);
    assert_eq!(before.0, funcs);
    assert_eq!(before.1, edges);
}

#[test]
fn test_gzip_inputs_match_plain_text() {
    let dir = tempfile::tempdir().unwrap();
    let gz = |name: &str, body: &str| {
        let path = dir.path().join(name);
        let mut enc = flate2::write::GzEncoder::new(std::fs::File::create(&path).unwrap(), flate2::Compression::fast());
        enc.write_all(body.as_bytes()).unwrap();
        enc.finish().unwrap();
        path
    };
    let info = gz("info-events.txt.gz", INFO);
    let events = gz("profile.txt.gz", EVENTS);

    let mut telemetry = Telemetry::new();
    let agg = collect(
        TraceInput::open(&info, TraceKind::Info).unwrap(),
        TraceInput::open(&events, TraceKind::Events).unwrap(),
        &mut telemetry,
    );
    let (_, plain, _) = build_graph();
    assert_eq!(agg.func_total(), plain.func_total());
    assert_eq!(agg.edge_total(), plain.edge_total());
}
