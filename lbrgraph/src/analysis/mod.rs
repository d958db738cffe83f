//! Aggregation and call-graph construction
//!
//! This module turns resolved samples into the weighted call graph:
//! [`SampleAggregator`] accumulates per-thread statistics, the filters pick
//! what to export, and a [`Clumper`] merges functions into graph nodes.

pub mod aggregator;
pub mod callgraph;
pub mod clumper;
pub mod filter;
pub mod stats;

pub use aggregator::{EdgeKey, SampleAggregator, TpidStats};
pub use callgraph::CallGraph;
pub use clumper::{Clumper, FunctionOrderClumper, NoClumping};
pub use filter::{AcceptAll, EdgeFilter, Findable, FuncFilter};
pub use stats::{EdgeStats, FuncStats, PerfEdge, PerfFunc};
