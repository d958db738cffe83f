//! Reading traces into a [`SampleAggregator`](crate::analysis::SampleAggregator)

pub mod collect;
pub mod reader;

pub use collect::{collect_events, collect_info, PassSummary, PROGRESS_INTERVAL};
pub use reader::{is_perf_data, perf_script_command, resolve_input, TraceInput, TraceKind, EVENT_DEFAULTS, INFO_DEFAULTS};
