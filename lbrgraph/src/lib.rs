//! # lbrgraph - Call Graphs from Last Branch Records
//!
//! lbrgraph reads `perf` profiles recorded with branch stacks
//! (`perf record -b`) and builds a weighted call graph whose nodes are
//! functions (or groups of functions that must be placed together) and whose
//! edges count observed calls. The graph is the input of function-ordering
//! tools that lay hot callers next to their callees.
//!
//! ## Pipeline
//!
//! ```text
//!  info events (mmap/fork)          sample events (ip + brstack)
//!          │                                   │
//!          ▼                                   ▼
//! ┌─────────────────┐                ┌─────────────────┐
//! │  trace::parse   │                │  trace::parse   │
//! └────────┬────────┘                └────────┬────────┘
//!          ▼                                   ▼
//! ┌─────────────────┐   translate    ┌─────────────────┐   resolve   ┌──────────────────┐
//! │    Mappings     │ ─────────────▶ │ SampleAggregator│ ──────────▶ │  SymbolRegistry  │
//! │ (per-pid mmaps) │                │ (per-thread)    │ ◀────────── │ (DSOs, clumps)   │
//! └─────────────────┘                └────────┬────────┘             └──────────────────┘
//!                                             │ filter + clump
//!                                             ▼
//!                                    ┌─────────────────┐
//!                                    │    CallGraph    │ ──▶ JSON / DOT / save state
//!                                    └─────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`trace`]: borrowed record types and the `perf script` line parser
//! - [`symbols`]: DSO and function-clump arenas, ELF symbol tables, and the
//!   mmap/fork replay that maps sampled addresses back to file offsets
//! - [`analysis`]: per-thread aggregation, filters, clumping, the call graph
//! - [`ingest`]: trace inputs (text, gzip, `perf script` child) and the two
//!   collection passes
//! - [`export`]: graph JSON and DOT output, save/reload of clumped state
//! - [`telemetry`]: run-wide counters reported at exit
//! - [`cli`]: command-line arguments
//! - [`domain`]: ids, timestamps, address ranges and error types
//!
//! ## Key Concepts
//!
//! - **LBR**: the CPU's ring of the last taken branches, sampled with each IP
//! - **DSO**: a mapped binary image (executable or shared object)
//! - **Clump**: one or more functions handled as a single graph node because
//!   their ranges overlap or they share a name
//! - **Trackable branch**: a call, or an unconditional direct/indirect jump
//!   (tail call); only these become call-graph edges
//!
//! ## Typical Usage
//!
//! ```bash
//! perf record -b -e cycles:u -- ./app
//! lbrgraph -p perf.data -r / --save app.json
//! lbrgraph --reload app.json,app-other-input.json --dot app.dot
//! ```

pub mod analysis;
pub mod cli;
pub mod domain;
pub mod export;
pub mod ingest;
pub mod symbols;
pub mod telemetry;
pub mod trace;
